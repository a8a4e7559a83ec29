//! Reconciliation loop for converging proxy configuration.
//!
//! The reconciler:
//! - Periodically lists backend instances from the membership source
//! - Reduces them to a host set and compares it with the last published one
//! - Renders, publishes and reloads when the host set changed

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::host_set::{has_changed, HostSet};
use crate::membership::{MembershipError, MembershipSource};
use crate::publish::{PublishError, Publisher};
use crate::reload::{ReloadError, ReloadTrigger};
use crate::render::{ConfigDigest, RenderParameters, RenderedConfig};
use crate::{
    DEFAULT_POLL_INTERVAL, DEFAULT_QUERY_TIMEOUT, DEFAULT_RELOAD_TIMEOUT, DEFAULT_SELECTOR,
};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between cycles.
    pub interval: Duration,

    /// Label selector passed to the membership source.
    pub selector: String,

    /// Bound on a single membership query.
    pub query_timeout: Duration,

    /// Bound on a single reload invocation.
    pub reload_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            selector: DEFAULT_SELECTOR.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            reload_timeout: DEFAULT_RELOAD_TIMEOUT,
        }
    }
}

/// Errors that abandon a cycle. None of them touch [`ReconcileState`].
#[derive(Debug, Error)]
pub enum CycleError {
    /// The membership query failed.
    #[error("membership query failed: {0}")]
    Membership(#[from] MembershipError),

    /// The membership query did not answer in time.
    #[error("membership query timed out after {0:?}")]
    MembershipTimeout(Duration),

    /// Writing the configuration failed.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Reloading the proxy failed.
    #[error(transparent)]
    Reload(#[from] ReloadError),
}

/// What a successful cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No running instance had an address; nothing was published.
    NoEligibleHosts { candidates: usize },

    /// The host set matches what is already published.
    Unchanged { hosts: HostSet },

    /// The host set changed but renders to the configuration already applied.
    ArtifactUnchanged { hosts: HostSet, digest: ConfigDigest },

    /// The configuration was already on disk; only the reload was repeated.
    ReloadRetried { hosts: HostSet, digest: ConfigDigest },

    /// New configuration was published and the proxy reloaded.
    Applied { hosts: HostSet, digest: ConfigDigest },
}

/// Configuration that was published but whose reload has not succeeded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReload {
    pub hosts: HostSet,
    pub digest: ConfigDigest,
}

/// State carried between cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileState {
    last_published: Option<HostSet>,
    last_digest: Option<ConfigDigest>,
    pending_reload: Option<PendingReload>,
}

impl ReconcileState {
    /// Host set whose configuration was published and reloaded.
    pub fn last_published(&self) -> Option<&HostSet> {
        self.last_published.as_ref()
    }

    /// Digest of the configuration that was last published and reloaded.
    pub fn last_digest(&self) -> Option<&ConfigDigest> {
        self.last_digest.as_ref()
    }

    pub fn pending_reload(&self) -> Option<&PendingReload> {
        self.pending_reload.as_ref()
    }

    fn mark_applied(&mut self, hosts: HostSet, digest: ConfigDigest) {
        self.last_published = Some(hosts);
        self.last_digest = Some(digest);
        self.pending_reload = None;
    }
}

/// Reconciler for converging proxy configuration.
pub struct Reconciler {
    config: ReconcilerConfig,
    params: RenderParameters,
    source: Arc<dyn MembershipSource>,
    publisher: Arc<dyn Publisher>,
    reloader: Arc<dyn ReloadTrigger>,
    state: ReconcileState,
}

impl Reconciler {
    /// Create a new reconciler with nothing published yet.
    pub fn new(
        config: ReconcilerConfig,
        params: RenderParameters,
        source: Arc<dyn MembershipSource>,
        publisher: Arc<dyn Publisher>,
        reloader: Arc<dyn ReloadTrigger>,
    ) -> Self {
        Self {
            config,
            params,
            source,
            publisher,
            reloader,
            state: ReconcileState::default(),
        }
    }

    pub fn state(&self) -> &ReconcileState {
        &self.state
    }

    /// Run the reconciliation loop until shutdown.
    ///
    /// The first cycle starts immediately. A cycle always runs to completion
    /// before the next tick is taken; shutdown interrupts the wait between
    /// cycles.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            selector = %self.config.selector,
            destination = %self.params.destination.display(),
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender dropped.
                        break;
                    }
                }
            }
        }

        info!("Reconciler shutting down");
    }

    /// Run one cycle and log its outcome.
    pub async fn run_once(&mut self) -> Result<CycleOutcome, CycleError> {
        let result = self.run_cycle().await;

        match &result {
            Ok(CycleOutcome::NoEligibleHosts { candidates }) => {
                warn!(candidates, "No relevant hosts identified");
            }
            Ok(CycleOutcome::Unchanged { hosts }) => {
                info!(host_count = hosts.len(), "Hosts did not change");
            }
            Ok(CycleOutcome::ArtifactUnchanged { hosts, digest }) => {
                info!(
                    hosts = %hosts,
                    digest = %digest,
                    "Rendered configuration unchanged, skipping publish"
                );
            }
            Ok(CycleOutcome::ReloadRetried { hosts, digest })
            | Ok(CycleOutcome::Applied { hosts, digest }) => {
                info!(
                    hosts = %hosts,
                    digest = %digest,
                    "Proxy configuration updated and reloaded"
                );
            }
            Err(CycleError::Reload(ReloadError::Exited {
                command,
                exit_code,
                stderr,
            })) => {
                error!(
                    command = %command,
                    exit_code = ?exit_code,
                    stderr = %stderr.trim(),
                    "Reload failed, will retry on next cycle"
                );
            }
            Err(e) => {
                error!(error = %e, "Reconciliation cycle failed");
            }
        }

        result
    }

    /// Perform a single reconciliation pass.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, CycleError> {
        debug!(selector = %self.config.selector, "Starting reconciliation");

        let instances = tokio::time::timeout(
            self.config.query_timeout,
            self.source.list_candidates(&self.config.selector),
        )
        .await
        .map_err(|_| CycleError::MembershipTimeout(self.config.query_timeout))??;

        let hosts = HostSet::reduce(&instances);
        if hosts.is_empty() {
            return Ok(CycleOutcome::NoEligibleHosts {
                candidates: instances.len(),
            });
        }

        match &self.state.pending_reload {
            Some(pending) if pending.hosts == hosts => {
                let digest = pending.digest.clone();
                info!(
                    hosts = %hosts,
                    digest = %digest,
                    "Retrying reload of published configuration"
                );

                self.reload().await?;
                self.state.mark_applied(hosts.clone(), digest.clone());
                return Ok(CycleOutcome::ReloadRetried { hosts, digest });
            }
            // The file on disk belongs to another host set: go through the full path.
            Some(_) => {}
            None if !has_changed(&hosts, self.state.last_published.as_ref()) => {
                return Ok(CycleOutcome::Unchanged { hosts });
            }
            None => {}
        }

        info!(
            hosts = %hosts,
            host_count = hosts.len(),
            candidates = instances.len(),
            "Found hosts"
        );

        let rendered = self.params.render(&hosts);
        let digest = rendered.digest().clone();

        if self.state.pending_reload.is_none()
            && self.state.last_digest.as_ref() == Some(&digest)
        {
            self.state.mark_applied(hosts.clone(), digest.clone());
            return Ok(CycleOutcome::ArtifactUnchanged { hosts, digest });
        }

        self.publish(&rendered).await?;
        self.state.pending_reload = Some(PendingReload {
            hosts: hosts.clone(),
            digest: digest.clone(),
        });

        self.reload().await?;
        self.state.mark_applied(hosts.clone(), digest.clone());

        Ok(CycleOutcome::Applied { hosts, digest })
    }

    async fn publish(&self, rendered: &RenderedConfig) -> Result<(), PublishError> {
        let destination = &self.params.destination;
        self.publisher.publish(rendered, destination).await?;

        info!(
            path = %destination.display(),
            digest = %rendered.digest(),
            bytes = rendered.as_bytes().len(),
            "Published proxy configuration"
        );
        Ok(())
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        let command = &self.params.reload_command;
        info!(command = %command, "Reloading proxy");

        let timeout = self.config.reload_timeout;
        match tokio::time::timeout(timeout, self.reloader.reload(command)).await {
            Ok(result) => result,
            Err(_) => Err(ReloadError::Timeout {
                command: command.to_string(),
                timeout,
            }),
        }
    }
}
