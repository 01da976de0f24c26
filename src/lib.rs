//! Screens, isolates and governs the execution of untrusted component code.
//!
//! ```no_run
//! use std::sync::Arc;
//! use construct_sandbox::{ExecutionRequest, ProcessBackend, Sandbox};
//!
//! # async fn demo() {
//! let sandbox = Sandbox::new(Arc::new(ProcessBackend::new("node", vec![])));
//! let result = sandbox
//!     .execute(ExecutionRequest::new("export const Card = () => 'hi'", "Card"))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&result).unwrap());
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod governor;
pub mod isolation;
pub mod policy;
pub mod sandbox;
pub mod screener;
pub mod source;
pub mod types;
pub mod vault;

pub use config::EngineConfig;
pub use error::{ConfigError, SandboxError, VaultError};
pub use governor::{CancelHandle, RunState};
pub use isolation::{InProcessBackend, IsolationBackend, ProcessBackend};
pub use sandbox::Sandbox;
pub use screener::Screener;
pub use types::{ExecutionRequest, ExecutionResult, Outcome, SecurityConfig, SecurityViolation};
pub use vault::{Vault, VaultBackend};
