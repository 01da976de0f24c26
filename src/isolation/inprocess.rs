//! In-process backend: components are native callables registered by name.
//!
//! Used when embedding the engine and in tests. The guest still only gets a
//! [`GuestHost`] and still runs under the governor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::{GuestEntry, IsolationBackend};
use crate::context::GuestHost;
use crate::error::SandboxError;
use crate::source::exported_names;

/// Signature of a registered component.
pub type GuestFn =
    Arc<dyn Fn(GuestHost, Value) -> BoxFuture<'static, Result<Value, SandboxError>> + Send + Sync>;

struct FnEntry {
    f: GuestFn,
}

#[async_trait]
impl GuestEntry for FnEntry {
    async fn invoke(&self, host: GuestHost, props: Value) -> Result<Value, SandboxError> {
        (self.f)(host, props).await
    }
}

#[derive(Default)]
pub struct InProcessBackend {
    entries: HashMap<String, Arc<dyn GuestEntry>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: impl Into<String>, entry: Arc<dyn GuestEntry>) {
        self.entries.insert(component.into(), entry);
    }

    pub fn register_fn<F>(&mut self, component: impl Into<String>, f: F)
    where
        F: Fn(GuestHost, Value) -> BoxFuture<'static, Result<Value, SandboxError>>
            + Send
            + Sync
            + 'static,
    {
        self.register(component, Arc::new(FnEntry { f: Arc::new(f) }));
    }

    pub fn with_fn<F>(mut self, component: impl Into<String>, f: F) -> Self
    where
        F: Fn(GuestHost, Value) -> BoxFuture<'static, Result<Value, SandboxError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_fn(component, f);
        self
    }
}

impl IsolationBackend for InProcessBackend {
    fn name(&self) -> &str {
        "in-process"
    }

    fn resolve_entry(
        &self,
        source: &str,
        component: &str,
    ) -> Result<Arc<dyn GuestEntry>, SandboxError> {
        if !exported_names(source).contains(component) {
            return Err(SandboxError::InvalidEntryPoint(format!(
                "'{component}' is not exported by the submitted source"
            )));
        }
        self.entries.get(component).cloned().ok_or_else(|| {
            SandboxError::InvalidEntryPoint(format!("'{component}' is not a callable component"))
        })
    }
}
