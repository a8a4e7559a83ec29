//! Atomic configuration file publisher.
//!
//! The rendered configuration is written to a hidden temporary file next to
//! the destination, flushed to disk, then renamed over the destination. The
//! rename is atomic on a single filesystem, so the proxy never reads a
//! partially written file.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};
use upsync_reconcile::{PublishError, Publisher, RenderedConfig};

/// Mode of published configuration files.
const FILE_MODE: u32 = 0o644;

/// Publishes configuration to the local filesystem.
///
/// The destination directory must already exist.
#[derive(Debug, Clone, Default)]
pub struct FilePublisher;

impl FilePublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for FilePublisher {
    async fn publish(
        &self,
        rendered: &RenderedConfig,
        destination: &Path,
    ) -> Result<(), PublishError> {
        write_atomic(destination, rendered.as_bytes())
    }
}

/// `.<name>.tmp` in the destination's directory.
fn temp_path(destination: &Path) -> Result<PathBuf, PublishError> {
    let file_name = destination.file_name().ok_or_else(|| {
        PublishError::new(
            "resolve",
            destination,
            io::Error::new(io::ErrorKind::InvalidInput, "destination has no file name"),
        )
    })?;

    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(".tmp");
    Ok(destination.with_file_name(temp_name))
}

fn write_atomic(destination: &Path, contents: &[u8]) -> Result<(), PublishError> {
    let temp = temp_path(destination)?;

    let result = write_temp(&temp, contents).and_then(|()| {
        fs::rename(&temp, destination).map_err(|e| PublishError::new("rename", destination, e))
    });

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %temp.display(), error = %e, "Failed to remove temporary file");
            }
        }
    }

    result
}

fn write_temp(temp: &Path, contents: &[u8]) -> Result<(), PublishError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(temp)
        .map_err(|e| PublishError::new("write", temp, e))?;

    // A stale temporary file keeps its old mode through `open`.
    file.set_permissions(Permissions::from_mode(FILE_MODE))
        .map_err(|e| PublishError::new("chmod", temp, e))?;
    file.write_all(contents)
        .map_err(|e| PublishError::new("write", temp, e))?;
    file.sync_all()
        .map_err(|e| PublishError::new("sync", temp, e))?;

    debug!(path = %temp.display(), bytes = contents.len(), "Wrote temporary file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(text: &str) -> RenderedConfig {
        RenderedConfig::new(text.to_string())
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/etc/nginx/sites-available/reverse-proxy.conf")).unwrap(),
            PathBuf::from("/etc/nginx/sites-available/.reverse-proxy.conf.tmp")
        );
        assert_eq!(
            temp_path(Path::new("proxy.conf")).unwrap(),
            PathBuf::from(".proxy.conf.tmp")
        );
        assert_eq!(temp_path(Path::new("/")).unwrap_err().op, "resolve");
    }

    #[tokio::test]
    async fn test_publish_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("proxy.conf");

        FilePublisher::new()
            .publish(&rendered("upstream backend {}\n"), &destination)
            .await
            .unwrap();

        assert_eq!(
            fs::read_to_string(&destination).unwrap(),
            "upstream backend {}\n"
        );
        let mode = fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert_eq!(entries(dir.path()), ["proxy.conf"]);
    }

    #[tokio::test]
    async fn test_publish_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("proxy.conf");
        fs::write(&destination, "a much longer previous configuration\n").unwrap();

        FilePublisher::new()
            .publish(&rendered("new\n"), &destination)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&destination).unwrap(), "new\n");
        assert_eq!(entries(dir.path()), ["proxy.conf"]);
    }

    #[tokio::test]
    async fn test_publish_overwrites_stale_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("proxy.conf");
        let stale = dir.path().join(".proxy.conf.tmp");
        fs::write(&stale, "leftover from a crash").unwrap();
        fs::set_permissions(&stale, Permissions::from_mode(0o600)).unwrap();

        FilePublisher::new()
            .publish(&rendered("fresh\n"), &destination)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&destination).unwrap(), "fresh\n");
        let mode = fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("missing").join("proxy.conf");

        let err = FilePublisher::new()
            .publish(&rendered("x"), &destination)
            .await
            .unwrap_err();

        assert_eq!(err.op, "write");
        assert_eq!(err.source.kind(), io::ErrorKind::NotFound);
        assert!(!dir.path().join("missing").exists());
    }

    #[tokio::test]
    async fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Renaming a file over a non-empty directory fails.
        let destination = dir.path().join("proxy.conf");
        fs::create_dir(&destination).unwrap();
        fs::write(destination.join("keep"), "").unwrap();

        let err = FilePublisher::new()
            .publish(&rendered("x"), &destination)
            .await
            .unwrap_err();

        assert_eq!(err.op, "rename");
        assert_eq!(err.path, destination);
        assert_eq!(entries(dir.path()), ["proxy.conf"]);
        assert!(destination.join("keep").exists());
    }
}
