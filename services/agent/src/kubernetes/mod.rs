//! Kubernetes pod membership.
//!
//! Lists pods matching a label selector across all namespaces through the
//! core v1 API, following `continue` tokens until the list is complete.

mod credentials;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tracing::debug;
use upsync_reconcile::{Instance, MembershipError, MembershipSource, Phase};

pub use credentials::{ClusterAccess, Credentials, SERVICE_ACCOUNT_DIR};

/// Pods requested per page.
const PAGE_LIMIT: u32 = 500;

/// Membership source backed by the Kubernetes API server.
pub struct KubernetesSource {
    client: reqwest::Client,
    server: String,
    credentials: Credentials,
}

impl KubernetesSource {
    /// Build a client for `access`; every request is bounded by `timeout`.
    pub fn new(access: ClusterAccess, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("upsync-agent/", env!("CARGO_PKG_VERSION")));

        if let Some(pem) = &access.certificate_authority {
            let certificates = reqwest::Certificate::from_pem_bundle(pem)
                .context("invalid certificate authority")?;
            if certificates.is_empty() {
                anyhow::bail!("certificate authority contains no certificates");
            }
            for certificate in certificates {
                builder = builder.add_root_certificate(certificate);
            }
        }
        if access.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let mut headers = HeaderMap::new();
        match &access.credentials {
            Credentials::ClientCertificate(pem) => {
                let identity =
                    reqwest::Identity::from_pem(pem).context("invalid client certificate")?;
                builder = builder.identity(identity);
            }
            Credentials::Token(token) => {
                headers.insert(AUTHORIZATION, sensitive(&format!("Bearer {token}"))?);
            }
            Credentials::Basic { username, password } => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                headers.insert(AUTHORIZATION, sensitive(&format!("Basic {encoded}"))?);
            }
            Credentials::TokenFile(_) | Credentials::Anonymous => {}
        }

        let client = builder
            .default_headers(headers)
            .build()
            .context("failed to build Kubernetes HTTP client")?;

        Ok(Self {
            client,
            server: access.server.trim_end_matches('/').to_string(),
            credentials: access.credentials,
        })
    }

    /// Token for this request when it comes from a file.
    fn file_token(&self) -> Result<Option<String>, MembershipError> {
        let Credentials::TokenFile(path) = &self.credentials else {
            return Ok(None);
        };

        let token = std::fs::read_to_string(path).map_err(|e| {
            MembershipError::with_source(
                format!("failed to read token file {}: {e}", path.display()),
                e,
            )
        })?;
        Ok(Some(token.trim().to_string()))
    }

    async fn list_page(
        &self,
        selector: &str,
        continue_token: Option<&str>,
    ) -> Result<PodList, MembershipError> {
        let url = format!("{}/api/v1/pods", self.server);
        let limit = PAGE_LIMIT.to_string();

        let mut query = vec![("labelSelector", selector), ("limit", limit.as_str())];
        if let Some(token) = continue_token {
            query.push(("continue", token));
        }

        let mut request = self.client.get(&url).query(&query);
        if let Some(token) = self.file_token()? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            MembershipError::with_source(format!("failed to list pods: {e}"), e)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MembershipError::new(format!(
                "failed to list pods: {status} - {}",
                body.trim()
            )));
        }

        response.json().await.map_err(|e| {
            MembershipError::with_source(format!("invalid pod list response: {e}"), e)
        })
    }
}

#[async_trait]
impl MembershipSource for KubernetesSource {
    async fn list_candidates(&self, selector: &str) -> Result<Vec<Instance>, MembershipError> {
        let mut instances = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let page = self.list_page(selector, continue_token.as_deref()).await?;
            debug!(
                selector = %selector,
                pod_count = page.items.len(),
                "Listed pods"
            );
            instances.extend(page.items.into_iter().map(Pod::into_instance));

            match page.metadata.continue_token.filter(|t| !t.is_empty()) {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        Ok(instances)
    }
}

fn sensitive(value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).context("credentials are not a valid header")?;
    value.set_sensitive(true);
    Ok(value)
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(default, rename = "continue")]
    continue_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    #[serde(default)]
    metadata: PodMeta,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct PodMeta {
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default, rename = "hostIP")]
    host_ip: Option<String>,
}

impl Pod {
    fn into_instance(self) -> Instance {
        let identity = format!("{}/{}", self.metadata.namespace, self.metadata.name);
        let phase = self
            .status
            .phase
            .as_deref()
            .map(Phase::parse)
            .unwrap_or(Phase::Unknown);
        Instance::new(identity, self.status.host_ip.as_deref(), phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_into_instance() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "web", "name": "web-0"},
            "status": {"phase": "Running", "hostIP": "10.0.0.1", "podIP": "172.16.0.4"}
        }))
        .unwrap();

        let instance = pod.into_instance();
        assert_eq!(instance.identity, "web/web-0");
        assert_eq!(instance.host_address.as_deref(), Some("10.0.0.1"));
        assert_eq!(instance.phase, Phase::Running);
        assert_eq!(instance.eligible_address(), Some("10.0.0.1"));
    }

    #[test]
    fn test_unscheduled_pod_has_no_address() {
        let pod: Pod = serde_json::from_value(serde_json::json!({
            "metadata": {"namespace": "web", "name": "web-1"},
            "status": {"phase": "Pending"}
        }))
        .unwrap();

        let instance = pod.into_instance();
        assert_eq!(instance.host_address, None);
        assert_eq!(instance.phase, Phase::Pending);
        assert_eq!(instance.eligible_address(), None);
    }

    #[test]
    fn test_pod_without_status() {
        let pod: Pod =
            serde_json::from_value(serde_json::json!({"metadata": {"name": "bare"}})).unwrap();
        assert_eq!(pod.into_instance().phase, Phase::Unknown);
    }

    #[test]
    fn test_invalid_certificate_authority() {
        let access = ClusterAccess {
            server: "https://127.0.0.1:6443".to_string(),
            certificate_authority: Some(b"not a certificate".to_vec()),
            insecure_skip_tls_verify: false,
            credentials: Credentials::Anonymous,
        };
        assert!(KubernetesSource::new(access, Duration::from_secs(1)).is_err());
    }
}
