//! Upstream reconciliation loop.
//!
//! This library keeps a proxy's upstream configuration converged with the
//! live membership of a backend pool. One reconciliation cycle is:
//!
//! - **Discover**: list candidate instances from a [`MembershipSource`].
//! - **Reduce**: keep running instances with an address, deduplicated into a [`HostSet`].
//! - **Detect**: compare against the last published host set.
//! - **Render**: produce the configuration text from a template.
//! - **Publish**: atomically replace the configuration file via a [`Publisher`].
//! - **Reload**: ask the proxy to pick up the new file via a [`ReloadTrigger`].
//!
//! # Invariants
//!
//! - An unchanged host set never causes a publish or a reload
//! - Rendering is deterministic for a given host set, port and template
//! - An empty host set is never published
//! - State only advances after publish and reload both succeed

use std::time::Duration;

mod host_set;
mod membership;
mod publish;
mod reconciler;
mod reload;
mod render;

pub use host_set::{has_changed, HostSet};
pub use membership::{Instance, MembershipError, MembershipSource, Phase};
pub use publish::{PublishError, Publisher};
pub use reconciler::{
    CycleError, CycleOutcome, PendingReload, ReconcileState, Reconciler, ReconcilerConfig,
};
pub use reload::{ParseReloadCommandError, ReloadCommand, ReloadError, ReloadTrigger};
pub use render::{render, ConfigDigest, RenderParameters, RenderedConfig};

pub use upsync_template::{Template, TemplateError};

/// Default interval between reconciliation cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single membership query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single reload invocation.
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Default label selector for backend instances.
pub const DEFAULT_SELECTOR: &str = "monitor=proxy";
