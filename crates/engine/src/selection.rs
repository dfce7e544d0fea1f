//! Selection sets and list query options
//!
//! A selection names the fields a caller wants. Keys that match a declared
//! relationship are traversed, keys that match a computed field are evaluated
//! and everything else is a plain column.
//!
//! The JSON form accepted by [`SelectionSet::from_json`]:
//!
//! ```text
//! { "id": true, "author": { "name": true },
//!   "posts": { "select": { "title": true }, "limit": 5,
//!              "orderBy": { "field": "createdAt", "direction": "desc" } } }
//! ```

use crate::error::{EngineError, EngineResult};
use crate::value::compare_values;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let ordering = compare_values(
            a.get(&self.field).unwrap_or(&Value::Null),
            b.get(&self.field).unwrap_or(&Value::Null),
        );
        match self.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    }

    /// Stable sort of `rows` by this ordering
    pub fn sort(&self, rows: &mut [Value]) {
        rows.sort_by(|a, b| self.compare(a, b));
    }
}

/// Equality filter, ordering and paging for list queries
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, rename = "where")]
    pub filter: Map<String, Value>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filter.insert(field.into(), value);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
            && self.order_by.is_none()
            && self.limit.is_none()
            && self.offset.is_none()
    }

    /// Whether `row` satisfies every equality condition
    pub fn matches(&self, row: &Value) -> bool {
        self.filter
            .iter()
            .all(|(field, expected)| row.get(field).unwrap_or(&Value::Null) == expected)
    }

    /// Filters, sorts and pages `rows` in that order
    pub fn apply(&self, rows: Vec<Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = rows.into_iter().filter(|row| self.matches(row)).collect();
        if let Some(order) = &self.order_by {
            order.sort(&mut rows);
        }
        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        rows.into_iter().skip(offset).take(limit).collect()
    }
}

/// What was requested for one key of a selection
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSelection {
    /// `field: true`
    Scalar,
    /// A nested selection, only meaningful for relationships
    Nested(NestedSelection),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NestedSelection {
    pub selection: SelectionSet,
    pub options: QueryOptions,
}

/// Ordered mapping of requested keys
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectionSet {
    entries: Vec<(String, FieldSelection)>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a plain or computed field
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.insert(name.into(), FieldSelection::Scalar);
        self
    }

    pub fn fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self.insert(name.into(), FieldSelection::Scalar);
        }
        self
    }

    /// Traverses a relationship with a nested selection
    pub fn relation(self, name: impl Into<String>, selection: SelectionSet) -> Self {
        self.relation_with(name, selection, QueryOptions::default())
    }

    /// Traverses a relationship with a nested selection and list options
    pub fn relation_with(
        mut self,
        name: impl Into<String>,
        selection: SelectionSet,
        options: QueryOptions,
    ) -> Self {
        self.insert(
            name.into(),
            FieldSelection::Nested(NestedSelection { selection, options }),
        );
        self
    }

    fn insert(&mut self, name: String, selection: FieldSelection) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = selection;
        } else {
            self.entries.push((name, selection));
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldSelection> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, selection)| selection)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSelection)> {
        self.entries.iter().map(|(name, sel)| (name.as_str(), sel))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The nested selection for `name`; a scalar selection of a relationship
    /// means "every column of the target"
    pub fn nested(&self, name: &str) -> Option<NestedSelection> {
        match self.get(name)? {
            FieldSelection::Scalar => Some(NestedSelection::default()),
            FieldSelection::Nested(nested) => Some(nested.clone()),
        }
    }

    pub fn from_json(value: &Value) -> EngineResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| EngineError::Query("selection must be an object".to_string()))?;

        let mut selection = SelectionSet::new();
        for (key, entry) in object {
            match entry {
                Value::Bool(true) => selection.insert(key.clone(), FieldSelection::Scalar),
                Value::Bool(false) => {}
                Value::Object(nested) => {
                    let nested = Self::nested_from_json(key, nested)?;
                    selection.insert(key.clone(), FieldSelection::Nested(nested));
                }
                other => {
                    return Err(EngineError::Query(format!(
                        "selection for '{}' must be a boolean or an object, got {}",
                        key, other
                    )))
                }
            }
        }
        Ok(selection)
    }

    fn nested_from_json(key: &str, object: &Map<String, Value>) -> EngineResult<NestedSelection> {
        let Some(select) = object.get("select") else {
            return Ok(NestedSelection {
                selection: Self::from_json(&Value::Object(object.clone()))?,
                options: QueryOptions::default(),
            });
        };

        let mut rest = object.clone();
        rest.remove("select");
        let options: QueryOptions = serde_json::from_value(Value::Object(rest))
            .map_err(|e| EngineError::Query(format!("invalid options for '{}': {}", key, e)))?;
        Ok(NestedSelection {
            selection: Self::from_json(select)?,
            options,
        })
    }
}
