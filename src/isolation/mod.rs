//! Isolation backends: where guest code actually runs.
//!
//! A backend resolves a component's entry point from submitted source; the
//! governor then drives the entry as its own task. Backends never see the
//! policies directly; everything they may touch goes through the
//! [`GuestHost`] handed to [`GuestEntry::invoke`].

pub mod inprocess;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::GuestHost;
use crate::error::SandboxError;

pub use inprocess::{GuestFn, InProcessBackend};
pub use process::ProcessBackend;

/// A resolved, callable component.
#[async_trait]
pub trait GuestEntry: Send + Sync {
    /// Runs the component with its props and returns what it rendered.
    async fn invoke(&self, host: GuestHost, props: Value) -> Result<Value, SandboxError>;
}

/// Pluggable isolation mechanism.
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Finds the callable for `component` in `source`. Must not execute
    /// any guest code.
    fn resolve_entry(
        &self,
        source: &str,
        component: &str,
    ) -> Result<Arc<dyn GuestEntry>, SandboxError>;
}
