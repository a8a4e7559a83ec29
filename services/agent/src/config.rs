//! Agent configuration.
//!
//! Every option is a flag with an `UPSYNC_*` environment fallback.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::NonEmptyStringValueParser;
use clap::Parser;
use upsync_reconcile::{
    ReconcilerConfig, ReloadCommand, RenderParameters, Template, DEFAULT_SELECTOR,
};

/// Keep a proxy's upstream configuration in sync with Kubernetes pods.
#[derive(Debug, Clone, Parser)]
#[command(name = "upsync-agent", version, about)]
pub struct Config {
    /// Path to the kubeconfig used to reach the API server.
    #[arg(
        long,
        env = "UPSYNC_KUBECONFIG",
        default_value = "/usr/local/etc/kubeconfig"
    )]
    pub kubeconfig: PathBuf,

    /// Use the pod's service account instead of a kubeconfig.
    #[arg(long, env = "UPSYNC_IN_CLUSTER")]
    pub in_cluster: bool,

    /// Template rendered into the proxy configuration.
    #[arg(
        long,
        env = "UPSYNC_TEMPLATE",
        default_value = "/usr/local/etc/nginx-template.conf"
    )]
    pub template: PathBuf,

    /// Where the rendered configuration is written.
    #[arg(
        long,
        env = "UPSYNC_OUTPUT",
        default_value = "/etc/nginx/sites-available/reverse-proxy.conf"
    )]
    pub output: PathBuf,

    /// Label selector for backend pods.
    #[arg(
        long,
        env = "UPSYNC_SELECTOR",
        default_value = DEFAULT_SELECTOR,
        value_parser = NonEmptyStringValueParser::new()
    )]
    pub selector: String,

    /// Backend port exposed to the template.
    #[arg(
        long,
        env = "UPSYNC_PORT",
        default_value_t = 32657,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub port: u16,

    /// Seconds between reconciliation cycles.
    #[arg(
        long = "interval",
        env = "UPSYNC_INTERVAL",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval_secs: u64,

    /// Command run after a new configuration is written.
    ///
    /// Split on whitespace without shell quoting; quotes are rejected.
    #[arg(
        long,
        env = "UPSYNC_RELOAD_COMMAND",
        default_value = "systemctl restart nginx"
    )]
    pub reload_command: ReloadCommand,

    /// Seconds before a pod query is abandoned.
    #[arg(
        long = "query-timeout",
        env = "UPSYNC_QUERY_TIMEOUT",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub query_timeout_secs: u64,

    /// Seconds before the reload command is killed.
    #[arg(
        long = "reload-timeout",
        env = "UPSYNC_RELOAD_TIMEOUT",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub reload_timeout_secs: u64,

    /// Run a single cycle and exit.
    #[arg(long, env = "UPSYNC_ONCE")]
    pub once: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "UPSYNC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.interval(),
            selector: self.selector.clone(),
            query_timeout: self.query_timeout(),
            reload_timeout: self.reload_timeout(),
        }
    }

    /// Read and parse the template file.
    pub fn load_template(&self) -> Result<Template> {
        let source = std::fs::read_to_string(&self.template)
            .with_context(|| format!("failed to read template {}", self.template.display()))?;
        let name = self
            .template
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".to_string());

        Template::parse(name, &source)
            .with_context(|| format!("invalid template {}", self.template.display()))
    }

    /// Everything the reconciler needs to render and apply a host set.
    pub fn render_parameters(&self) -> Result<RenderParameters> {
        Ok(RenderParameters {
            template: self.load_template()?,
            port: self.port,
            destination: self.output.clone(),
            reload_command: self.reload_command.clone(),
        })
    }
}
