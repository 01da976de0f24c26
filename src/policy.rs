//! Compiles a declarative `SecurityConfig` into enforceable policies.
//!
//! Compilation never fails: every unset field gets an explicit default so
//! nothing is left ambiguous at runtime. Network access is opt-in.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::{CredentialPolicy, SecurityConfig};

/// 50 MiB.
pub const DEFAULT_MAX_MEMORY_BYTES: u64 = 50 * 1024 * 1024;

pub const DEFAULT_EXECUTION_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_MAX_REQUESTS: u32 = 10;

pub const DEFAULT_MEMORY_SAMPLE_INTERVAL_MS: u64 = 100;

pub const DEFAULT_MAX_LOG_LINES: usize = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    /// Advisory: forwarded to backends that can pin cores.
    pub cpu_cores: Option<f64>,
    /// Advisory: forwarded to backends that can throttle CPU.
    pub cpu_percent: Option<f64>,
    pub max_memory_bytes: u64,
    pub execution_timeout: Duration,
}

impl ResourcePolicy {
    pub fn execution_timeout_ms(&self) -> u64 {
        self.execution_timeout.as_millis() as u64
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            cpu_cores: None,
            cpu_percent: None,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            execution_timeout: Duration::from_millis(DEFAULT_EXECUTION_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPolicy {
    /// Normalized host names; `*.example.com` matches any subdomain.
    pub allowed_hosts: BTreeSet<String>,
    pub block_all: bool,
    pub max_requests: u32,
    pub max_bandwidth_bytes_per_sec: Option<u64>,
}

impl NetworkPolicy {
    /// Whether a request to `host` is permitted.
    ///
    /// An empty allow-list only permits traffic when the caller explicitly
    /// asked for unrestricted network.
    pub fn allows(&self, host: &str) -> bool {
        if self.block_all {
            return false;
        }
        if self.allowed_hosts.is_empty() {
            return true;
        }
        let host = normalize_host(host);
        self.allowed_hosts.iter().any(|allowed| {
            match allowed.strip_prefix("*.") {
                Some(parent) => host
                    .strip_suffix(parent)
                    .is_some_and(|prefix| prefix.ends_with('.')),
                None => *allowed == host,
            }
        })
    }
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            allowed_hosts: BTreeSet::new(),
            block_all: true,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_bandwidth_bytes_per_sec: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringPolicy {
    pub memory_sample_interval: Duration,
    pub max_log_lines: usize,
}

impl Default for MonitoringPolicy {
    fn default() -> Self {
        Self {
            memory_sample_interval: Duration::from_millis(DEFAULT_MEMORY_SAMPLE_INTERVAL_MS),
            max_log_lines: DEFAULT_MAX_LOG_LINES,
        }
    }
}

/// Everything a run needs to be enforced.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub resource: ResourcePolicy,
    pub network: NetworkPolicy,
    pub monitoring: MonitoringPolicy,
    pub credentials: CredentialPolicy,
}

/// Fills every gap in `config` with its default.
pub fn compile(config: &SecurityConfig) -> CompiledPolicy {
    let limits = &config.resource_limits;
    let resource = ResourcePolicy {
        cpu_cores: limits.cpu_cores,
        cpu_percent: limits.cpu_percent,
        max_memory_bytes: limits.max_memory_bytes.unwrap_or(DEFAULT_MAX_MEMORY_BYTES),
        execution_timeout: Duration::from_millis(
            limits
                .execution_timeout_ms
                .unwrap_or(DEFAULT_EXECUTION_TIMEOUT_MS),
        ),
    };

    let net = &config.network;
    let allowed_hosts: BTreeSet<String> = net
        .allowed_hosts
        .iter()
        .map(|h| normalize_host(h))
        .filter(|h| !h.is_empty())
        .collect();
    let block_all = match net.block_all_network {
        Some(explicit) => explicit,
        None => allowed_hosts.is_empty(),
    };
    let network = NetworkPolicy {
        allowed_hosts,
        block_all,
        max_requests: net.max_requests.unwrap_or(DEFAULT_MAX_REQUESTS),
        max_bandwidth_bytes_per_sec: net.max_bandwidth_bytes_per_sec.filter(|b| *b > 0),
    };

    let monitoring = MonitoringPolicy {
        memory_sample_interval: Duration::from_millis(
            config
                .monitoring
                .memory_sample_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_MEMORY_SAMPLE_INTERVAL_MS),
        ),
        max_log_lines: config
            .monitoring
            .max_log_lines
            .unwrap_or(DEFAULT_MAX_LOG_LINES),
    };

    CompiledPolicy {
        resource,
        network,
        monitoring,
        credentials: config.credentials.clone(),
    }
}

/// Lowercase, trimmed, without a trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}
