//! Publishing rendered configuration.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::render::RenderedConfig;

/// A failed publish. The destination is left as it was.
#[derive(Debug, Error)]
#[error("failed to {op} {}: {source}", .path.display())]
pub struct PublishError {
    /// Step that failed (for example "write" or "rename").
    pub op: &'static str,

    /// File the step operated on.
    pub path: PathBuf,

    #[source]
    pub source: io::Error,
}

impl PublishError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Writes rendered configuration to its destination.
///
/// Implementations must be atomic: a concurrent reader of `destination` sees
/// either the previous content or the new content, never a mix.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        rendered: &RenderedConfig,
        destination: &Path,
    ) -> Result<(), PublishError>;
}
