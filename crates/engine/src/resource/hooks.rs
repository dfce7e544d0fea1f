//! Lifecycle hooks run around mutations
//!
//! `before*` hooks may return a replacement for the incoming data; `after*`
//! hooks observe the result. Any hook error aborts the mutation.

use crate::error::{BoxError, EngineError, EngineResult};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The six lifecycle points a hook can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl HookKind {
    pub const ALL: [HookKind; 6] = [
        Self::BeforeCreate,
        Self::AfterCreate,
        Self::BeforeUpdate,
        Self::AfterUpdate,
        Self::BeforeDelete,
        Self::AfterDelete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeCreate => "beforeCreate",
            Self::AfterCreate => "afterCreate",
            Self::BeforeUpdate => "beforeUpdate",
            Self::AfterUpdate => "afterUpdate",
            Self::BeforeDelete => "beforeDelete",
            Self::AfterDelete => "afterDelete",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook is called with
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    BeforeCreate { data: Map<String, Value> },
    AfterCreate { entity: Value },
    BeforeUpdate { id: String, data: Map<String, Value> },
    AfterUpdate { entity: Value },
    BeforeDelete { id: String },
    AfterDelete { id: String },
}

/// `Ok(Some(data))` from a before-hook replaces the mutation input
pub type HookResult = Result<Option<Map<String, Value>>, BoxError>;

pub type SyncHookFn = Arc<dyn Fn(&HookEvent) -> HookResult + Send + Sync>;
pub type AsyncHookFn = Arc<dyn Fn(HookEvent) -> BoxFuture<'static, HookResult> + Send + Sync>;

#[derive(Clone)]
pub enum Hook {
    Sync(SyncHookFn),
    Async(AsyncHookFn),
}

impl Hook {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&HookEvent) -> HookResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F>(f: F) -> Self
    where
        F: Fn(HookEvent) -> BoxFuture<'static, HookResult> + Send + Sync + 'static,
    {
        Self::Async(Arc::new(f))
    }

    pub async fn call(&self, event: HookEvent) -> HookResult {
        match self {
            Self::Sync(f) => f(&event),
            Self::Async(f) => f(event).await,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Hook::Sync"),
            Self::Async(_) => f.write_str("Hook::Async"),
        }
    }
}

/// Validated hooks of one resource
#[derive(Clone, Default)]
pub struct HookSet {
    resource: String,
    hooks: HashMap<HookKind, Hook>,
}

impl HookSet {
    /// Resolves hook names; unknown names are a registration error
    pub fn from_named(resource: &str, named: &[(String, Hook)]) -> EngineResult<Self> {
        let mut hooks = HashMap::new();
        for (name, hook) in named {
            let kind = HookKind::parse(name).ok_or_else(|| {
                EngineError::registration(resource, format!("unknown hook '{}'", name))
            })?;
            hooks.insert(kind, hook.clone());
        }
        Ok(Self {
            resource: resource.to_string(),
            hooks,
        })
    }

    pub fn has(&self, kind: HookKind) -> bool {
        self.hooks.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    async fn run(&self, kind: HookKind, event: HookEvent) -> EngineResult<Option<Map<String, Value>>> {
        let Some(hook) = self.hooks.get(&kind) else {
            return Ok(None);
        };
        tracing::trace!(resource = %self.resource, hook = %kind, "running hook");
        hook.call(event).await.map_err(|e| EngineError::Hook {
            resource: self.resource.clone(),
            hook: kind.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn before_create(&self, data: Map<String, Value>) -> EngineResult<Map<String, Value>> {
        let replaced = self
            .run(HookKind::BeforeCreate, HookEvent::BeforeCreate { data: data.clone() })
            .await?;
        Ok(replaced.unwrap_or(data))
    }

    pub async fn after_create(&self, entity: &Value) -> EngineResult<()> {
        self.run(HookKind::AfterCreate, HookEvent::AfterCreate { entity: entity.clone() })
            .await
            .map(|_| ())
    }

    pub async fn before_update(&self, id: &str, data: Map<String, Value>) -> EngineResult<Map<String, Value>> {
        let replaced = self
            .run(
                HookKind::BeforeUpdate,
                HookEvent::BeforeUpdate {
                    id: id.to_string(),
                    data: data.clone(),
                },
            )
            .await?;
        Ok(replaced.unwrap_or(data))
    }

    pub async fn after_update(&self, entity: &Value) -> EngineResult<()> {
        self.run(HookKind::AfterUpdate, HookEvent::AfterUpdate { entity: entity.clone() })
            .await
            .map(|_| ())
    }

    pub async fn before_delete(&self, id: &str) -> EngineResult<()> {
        self.run(HookKind::BeforeDelete, HookEvent::BeforeDelete { id: id.to_string() })
            .await
            .map(|_| ())
    }

    pub async fn after_delete(&self, id: &str) -> EngineResult<()> {
        self.run(HookKind::AfterDelete, HookEvent::AfterDelete { id: id.to_string() })
            .await
            .map(|_| ())
    }
}

impl fmt::Debug for HookSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.hooks.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("HookSet")
            .field("resource", &self.resource)
            .field("hooks", &kinds)
            .finish()
    }
}
