//! API server access resolved from a kubeconfig or the in-cluster service account.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;

/// Mount point of the pod's service account secret.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// How requests authenticate to the API server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    /// Static bearer token.
    Token(String),
    /// Bearer token re-read from disk on every request, so rotated tokens are picked up.
    TokenFile(PathBuf),
    Basic { username: String, password: String },
    /// PEM client certificate followed by its private key.
    ClientCertificate(Vec<u8>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::TokenFile(path) => f.debug_tuple("TokenFile").field(path).finish(),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::ClientCertificate(_) => f.write_str("ClientCertificate(<redacted>)"),
        }
    }
}

/// Everything needed to talk to one API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAccess {
    /// Base URL, for example `https://10.0.0.1:6443`.
    pub server: String,

    /// PEM bundle trusted in addition to the system roots.
    pub certificate_authority: Option<Vec<u8>>,

    pub insecure_skip_tls_verify: bool,

    pub credentials: Credentials,
}

impl ClusterAccess {
    /// Resolve the current context of the kubeconfig at `path`.
    ///
    /// Relative file references inside the kubeconfig are resolved against
    /// its directory.
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse kubeconfig {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        kubeconfig
            .resolve(base)
            .with_context(|| format!("invalid kubeconfig {}", path.display()))
    }

    /// Access through the pod's service account.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST is not set; not running inside a cluster?")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .context("KUBERNETES_SERVICE_PORT is not set; not running inside a cluster?")?;

        Self::from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
    }

    fn from_service_account(host: &str, port: &str, dir: &Path) -> Result<Self> {
        let token_file = dir.join("token");
        if !token_file.is_file() {
            bail!("service account token {} not found", token_file.display());
        }

        let ca_file = dir.join("ca.crt");
        let certificate_authority = std::fs::read(&ca_file)
            .with_context(|| format!("failed to read {}", ca_file.display()))?;

        // IPv6 service hosts need brackets in a URL.
        let server = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        Ok(Self {
            server,
            certificate_authority: Some(certificate_authority),
            insecure_skip_tls_verify: false,
            credentials: Credentials::TokenFile(token_file),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<Named<Cluster>>,
    #[serde(default)]
    contexts: Vec<Named<KubeContext>>,
    #[serde(default)]
    users: Vec<Named<User>>,
    #[serde(default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "cluster", alias = "context", alias = "user")]
    value: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct KubeContext {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct User {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key: Option<PathBuf>,
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    exec: Option<serde_yaml::Value>,
    #[serde(default)]
    auth_provider: Option<serde_yaml::Value>,
}

impl Kubeconfig {
    fn resolve(&self, base: &Path) -> Result<ClusterAccess> {
        let context_name = self
            .current_context
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("no current-context set"))?;
        let context = find(&self.contexts, context_name, "context")?;
        let cluster = find(&self.clusters, &context.cluster, "cluster")?;

        if cluster.server.is_empty() {
            bail!("cluster {:?} has no server", context.cluster);
        }

        let certificate_authority = pem_source(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base,
            "certificate-authority",
        )?;

        let credentials = match context.user.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => find(&self.users, name, "user")?.credentials(base)?,
            None => Credentials::Anonymous,
        };

        Ok(ClusterAccess {
            server: cluster.server.trim_end_matches('/').to_string(),
            certificate_authority,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            credentials,
        })
    }
}

impl User {
    fn credentials(&self, base: &Path) -> Result<Credentials> {
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Credentials::Token(token.to_string()));
        }
        if let Some(path) = &self.token_file {
            return Ok(Credentials::TokenFile(base.join(path)));
        }

        let certificate = pem_source(
            self.client_certificate_data.as_deref(),
            self.client_certificate.as_deref(),
            base,
            "client-certificate",
        )?;
        let key = pem_source(
            self.client_key_data.as_deref(),
            self.client_key.as_deref(),
            base,
            "client-key",
        )?;
        match (certificate, key) {
            (Some(mut pem), Some(key)) => {
                if !pem.ends_with(b"\n") {
                    pem.push(b'\n');
                }
                pem.extend_from_slice(&key);
                return Ok(Credentials::ClientCertificate(pem));
            }
            (None, None) => {}
            _ => bail!("client-certificate and client-key must be set together"),
        }

        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            });
        }

        if self.exec.is_some() {
            bail!("exec credential plugins are not supported");
        }
        if self.auth_provider.is_some() {
            bail!("auth-provider credentials are not supported");
        }

        Ok(Credentials::Anonymous)
    }
}

fn find<'a, T>(entries: &'a [Named<T>], name: &str, kind: &str) -> Result<&'a T> {
    entries
        .iter()
        .find(|entry| entry.name == name)
        .map(|entry| &entry.value)
        .ok_or_else(|| anyhow!("{kind} {name:?} not found"))
}

/// Inline base64 data wins over a file reference.
fn pem_source(
    data: Option<&str>,
    file: Option<&Path>,
    base: &Path,
    field: &str,
) -> Result<Option<Vec<u8>>> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let bytes = STANDARD
            .decode(data.trim())
            .with_context(|| format!("{field}-data is not valid base64"))?;
        return Ok(Some(bytes));
    }

    match file {
        Some(file) => {
            let path = base.join(file);
            let bytes = std::fs::read(&path)
                .with_context(|| format!("failed to read {field} {}", path.display()))?;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nY2E=\n-----END CERTIFICATE-----\n";

    fn write_kubeconfig(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("kubeconfig");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_token_user_with_inline_ca() {
        let dir = tempfile::tempdir().unwrap();
        let body = format!(
            r#"
apiVersion: v1
kind: Config
current-context: prod
clusters:
- name: prod-cluster
  cluster:
    server: https://10.0.0.1:6443/
    certificate-authority-data: {}
contexts:
- name: staging
  context:
    cluster: missing
    user: nobody
- name: prod
  context:
    cluster: prod-cluster
    user: upsync
users:
- name: upsync
  user:
    token: s3cret
"#,
            STANDARD.encode(CA_PEM)
        );
        let path = write_kubeconfig(dir.path(), &body);

        let access = ClusterAccess::from_kubeconfig(&path).unwrap();
        assert_eq!(access.server, "https://10.0.0.1:6443");
        assert_eq!(access.certificate_authority.as_deref(), Some(CA_PEM.as_bytes()));
        assert!(!access.insecure_skip_tls_verify);
        assert_eq!(access.credentials, Credentials::Token("s3cret".to_string()));
    }

    #[test]
    fn test_relative_files_resolve_against_kubeconfig_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), CA_PEM).unwrap();
        std::fs::write(dir.path().join("client.crt"), "CERT").unwrap();
        std::fs::write(dir.path().join("client.key"), "KEY\n").unwrap();
        let path = write_kubeconfig(
            dir.path(),
            r#"
current-context: local
clusters:
- name: local
  cluster:
    server: https://127.0.0.1:6443
    certificate-authority: ca.crt
contexts:
- name: local
  context:
    cluster: local
    user: admin
users:
- name: admin
  user:
    client-certificate: client.crt
    client-key: client.key
"#,
        );

        let access = ClusterAccess::from_kubeconfig(&path).unwrap();
        assert_eq!(access.certificate_authority.as_deref(), Some(CA_PEM.as_bytes()));
        assert_eq!(
            access.credentials,
            Credentials::ClientCertificate(b"CERT\nKEY\n".to_vec())
        );
    }

    #[test]
    fn test_token_file_and_insecure_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_kubeconfig(
            dir.path(),
            r#"
current-context: dev
clusters:
- name: dev
  cluster:
    server: https://dev.example.com
    insecure-skip-tls-verify: true
contexts:
- name: dev
  context:
    cluster: dev
    user: bot
users:
- name: bot
  user:
    tokenFile: secrets/token
"#,
        );

        let access = ClusterAccess::from_kubeconfig(&path).unwrap();
        assert!(access.insecure_skip_tls_verify);
        assert!(access.certificate_authority.is_none());
        assert_eq!(
            access.credentials,
            Credentials::TokenFile(dir.path().join("secrets/token"))
        );
    }

    #[test]
    fn test_context_without_user_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_kubeconfig(
            dir.path(),
            r#"
current-context: anon
clusters:
- name: anon
  cluster:
    server: http://127.0.0.1:8080
contexts:
- name: anon
  context:
    cluster: anon
"#,
        );

        let access = ClusterAccess::from_kubeconfig(&path).unwrap();
        assert_eq!(access.credentials, Credentials::Anonymous);
    }

    #[rstest::rstest]
    #[case::no_current_context("clusters: []\ncontexts: []\n", "no current-context")]
    #[case::unknown_context("current-context: gone\n", "context \"gone\" not found")]
    #[case::unknown_cluster(
        "current-context: c\ncontexts:\n- name: c\n  context:\n    cluster: x\n",
        "cluster \"x\" not found"
    )]
    #[case::exec_plugin(
        "current-context: c\nclusters:\n- name: k\n  cluster:\n    server: https://k\ncontexts:\n- name: c\n  context:\n    cluster: k\n    user: u\nusers:\n- name: u\n  user:\n    exec:\n      command: aws\n",
        "exec credential plugins are not supported"
    )]
    #[case::bad_base64(
        "current-context: c\nclusters:\n- name: k\n  cluster:\n    server: https://k\n    certificate-authority-data: '%%%'\ncontexts:\n- name: c\n  context:\n    cluster: k\n",
        "not valid base64"
    )]
    fn test_invalid_kubeconfig(#[case] body: &str, #[case] expected: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = write_kubeconfig(dir.path(), body);

        let err = ClusterAccess::from_kubeconfig(&path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains(expected), "{message}");
    }

    #[test]
    fn test_missing_kubeconfig() {
        let err = ClusterAccess::from_kubeconfig(Path::new("/nonexistent/kubeconfig")).unwrap_err();
        assert!(err.to_string().contains("failed to read kubeconfig"));
    }

    #[test]
    fn test_service_account() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "sa-token").unwrap();
        std::fs::write(dir.path().join("ca.crt"), CA_PEM).unwrap();

        let access = ClusterAccess::from_service_account("10.96.0.1", "443", dir.path()).unwrap();
        assert_eq!(access.server, "https://10.96.0.1:443");
        assert_eq!(access.certificate_authority.as_deref(), Some(CA_PEM.as_bytes()));
        assert_eq!(
            access.credentials,
            Credentials::TokenFile(dir.path().join("token"))
        );

        let v6 = ClusterAccess::from_service_account("fd00::1", "443", dir.path()).unwrap();
        assert_eq!(v6.server, "https://[fd00::1]:443");
    }

    #[test]
    fn test_service_account_without_token() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClusterAccess::from_service_account("10.96.0.1", "443", dir.path()).unwrap_err();
        assert!(err.to_string().contains("token"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let token = format!("{:?}", Credentials::Token("s3cret".to_string()));
        assert!(!token.contains("s3cret"));

        let basic = format!(
            "{:?}",
            Credentials::Basic {
                username: "admin".to_string(),
                password: "hunter2".to_string(),
            }
        );
        assert!(basic.contains("admin"));
        assert!(!basic.contains("hunter2"));
    }
}
