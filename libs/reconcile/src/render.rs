//! Rendering host sets into configuration text.

use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use upsync_template::{Template, TemplateData};

use crate::host_set::HostSet;
use crate::reload::ReloadCommand;

/// Content digest of a rendered configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDigest(String);

impl ConfigDigest {
    /// Digest raw configuration bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration text produced for one host set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig {
    text: String,
    digest: ConfigDigest,
}

impl RenderedConfig {
    pub fn new(text: String) -> Self {
        let digest = ConfigDigest::from_bytes(text.as_bytes());
        Self { text, digest }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn digest(&self) -> &ConfigDigest {
        &self.digest
    }
}

/// Render `hosts` with `port` into `template`.
///
/// Hosts are handed to the template in the set's lexicographic order, so the
/// output only depends on which hosts are present.
pub fn render(hosts: &HostSet, port: u16, template: &Template) -> RenderedConfig {
    let data = TemplateData {
        hosts: hosts.iter().collect(),
        port,
    };
    RenderedConfig::new(template.execute(&data))
}

/// Fixed parameters for rendering and applying configuration.
///
/// Loaded once at startup.
#[derive(Debug, Clone)]
pub struct RenderParameters {
    /// Parsed configuration template.
    pub template: Template,

    /// Port proxied on every backend host.
    pub port: u16,

    /// Path the rendered configuration is published to.
    pub destination: PathBuf,

    /// Command that makes the proxy pick up the new configuration.
    pub reload_command: ReloadCommand,
}

impl RenderParameters {
    pub fn render(&self, hosts: &HostSet) -> RenderedConfig {
        render(hosts, self.port, &self.template)
    }
}
