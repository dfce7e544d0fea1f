//! Resource declarations and their validated, registered form

use super::hooks::{Hook, HookSet};
use super::relationship::Relationship;
use crate::error::{BoxError, EngineError, EngineResult};
use crate::loading::BatchLoader;
use futures::future::BoxFuture;
use resource_schema::ObjectSchema;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Context handed to computed-field functions
#[derive(Clone)]
pub struct ComputeContext {
    /// Resource that owns the field
    pub resource: String,
    /// Loader of the current request, for fetching related data
    pub loader: BatchLoader,
}

pub type SyncComputeFn = Arc<dyn Fn(&Value, &ComputeContext) -> Result<Value, BoxError> + Send + Sync>;
pub type AsyncComputeFn =
    Arc<dyn Fn(Value, ComputeContext) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>;

/// Field derived from an entity rather than stored
#[derive(Clone)]
pub enum ComputedField {
    Sync(SyncComputeFn),
    Async(AsyncComputeFn),
}

impl ComputedField {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Value, &ComputeContext) -> Result<Value, BoxError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: Fn(Value, ComputeContext) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync + 'static,
    {
        Self::Async(Arc::new(f))
    }

    pub async fn evaluate(&self, entity: &Value, ctx: &ComputeContext) -> Result<Value, BoxError> {
        match self {
            Self::Sync(f) => f(entity, ctx),
            Self::Async(f) => f(entity.clone(), ctx.clone()).await,
        }
    }
}

impl fmt::Debug for ComputedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("ComputedField::Sync"),
            Self::Async(_) => f.write_str("ComputedField::Async"),
        }
    }
}

/// Declarative description of a resource, checked on registration
#[derive(Clone)]
pub struct ResourceDefinition {
    name: String,
    table: Option<String>,
    schema: Option<Arc<dyn ObjectSchema>>,
    relationships: Vec<(String, Relationship)>,
    computed: Vec<(String, ComputedField)>,
    hooks: Vec<(String, Hook)>,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            schema: None,
            relationships: Vec::new(),
            computed: Vec::new(),
            hooks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage table; defaults to the resource name
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn schema<S: ObjectSchema + 'static>(mut self, schema: S) -> Self {
        self.schema = Some(Arc::new(schema));
        self
    }

    pub fn shared_schema(mut self, schema: Arc<dyn ObjectSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, relationship: Relationship) -> Self {
        upsert(&mut self.relationships, name.into(), relationship);
        self
    }

    pub fn computed(mut self, name: impl Into<String>, field: ComputedField) -> Self {
        upsert(&mut self.computed, name.into(), field);
        self
    }

    /// Attaches a hook by lifecycle name (`beforeCreate`, `afterDelete`, ...)
    pub fn hook(mut self, name: impl Into<String>, hook: Hook) -> Self {
        upsert(&mut self.hooks, name.into(), hook);
        self
    }

    /// Validates the declaration and produces the registered form
    pub(crate) fn into_resource(self) -> EngineResult<Resource> {
        validate_name(&self.name)?;

        let schema = self
            .schema
            .ok_or_else(|| EngineError::registration(&self.name, "a schema is required"))?;

        let table = match self.table {
            Some(table) if table.trim().is_empty() => {
                return Err(EngineError::registration(&self.name, "table name cannot be empty"))
            }
            Some(table) => table,
            None => self.name.clone(),
        };

        for (rel_name, relationship) in &self.relationships {
            relationship.validate(&self.name, rel_name)?;
        }

        for (field, _) in &self.computed {
            if field.trim().is_empty() {
                return Err(EngineError::registration(&self.name, "computed field name cannot be empty"));
            }
            if self.relationships.iter().any(|(rel, _)| rel == field) {
                return Err(EngineError::registration(
                    &self.name,
                    format!("'{}' is declared as both a relationship and a computed field", field),
                ));
            }
        }

        let hooks = HookSet::from_named(&self.name, &self.hooks)?;

        Ok(Resource {
            name: self.name,
            table,
            schema,
            relationships: self.relationships,
            computed: self.computed,
            hooks,
        })
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("relationships", &self.relationships)
            .finish_non_exhaustive()
    }
}

fn upsert<T>(entries: &mut Vec<(String, T)>, name: String, value: T) {
    if let Some(slot) = entries.iter_mut().find(|(n, _)| *n == name) {
        slot.1 = value;
    } else {
        entries.push((name, value));
    }
}

/// Names start with a lowercase letter followed by letters or digits
fn validate_name(name: &str) -> EngineResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => first.is_ascii_lowercase() && chars.all(|c| c.is_ascii_alphanumeric()),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::registration(
            name,
            "resource names must be camelCase and start with a lowercase letter",
        ))
    }
}

/// A registered resource. Immutable once registered.
pub struct Resource {
    name: String,
    table: String,
    schema: Arc<dyn ObjectSchema>,
    relationships: Vec<(String, Relationship)>,
    computed: Vec<(String, ComputedField)>,
    hooks: HookSet,
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> &dyn ObjectSchema {
        self.schema.as_ref()
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, rel)| rel)
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&str, &Relationship)> {
        self.relationships.iter().map(|(n, rel)| (n.as_str(), rel))
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn computed_field(&self, name: &str) -> Option<&ComputedField> {
        self.computed.iter().find(|(n, _)| n == name).map(|(_, f)| f)
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = (&str, &ComputedField)> {
        self.computed.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn is_relationship(&self, name: &str) -> bool {
        self.relationship(name).is_some()
    }

    pub fn is_computed(&self, name: &str) -> bool {
        self.computed_field(name).is_some()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.schema.field_names())
            .field("relationships", &self.relationships)
            .field("computed", &self.computed.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .finish()
    }
}
