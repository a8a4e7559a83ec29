//! Backend membership as reported by the orchestration platform.

use async_trait::async_trait;
use thiserror::Error;

/// Lifecycle phase of a candidate instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    /// Parse a platform phase string. Unrecognised values map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "Pending" => Phase::Pending,
            "Running" => Phase::Running,
            "Succeeded" => Phase::Succeeded,
            "Failed" => Phase::Failed,
            _ => Phase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate backend instance.
///
/// Only lives for the duration of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Platform identity (for example `namespace/name`).
    pub identity: String,

    /// Address of the host the instance runs on, if scheduled.
    pub host_address: Option<String>,

    /// Current phase.
    pub phase: Phase,
}

impl Instance {
    pub fn new(identity: impl Into<String>, host_address: Option<&str>, phase: Phase) -> Self {
        Self {
            identity: identity.into(),
            host_address: host_address.map(str::to_string),
            phase,
        }
    }

    /// The address to route to, if this instance may receive traffic.
    pub fn eligible_address(&self) -> Option<&str> {
        if self.phase != Phase::Running {
            return None;
        }

        self.host_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }
}

/// A failed membership query.
///
/// Always transient: the loop logs it and tries again on the next tick.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct MembershipError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MembershipError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Source of candidate backend instances.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// List every instance matching `selector`, across all namespaces.
    async fn list_candidates(&self, selector: &str) -> Result<Vec<Instance>, MembershipError>;
}
