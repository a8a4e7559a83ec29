//! Full cycles with the real collaborators: a mock API server, a temporary
//! output directory and a shell reload command.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use upsync_agent::{ClusterAccess, CommandReload, Credentials, FilePublisher, KubernetesSource};
use upsync_reconcile::{
    CycleError, CycleOutcome, Reconciler, ReconcilerConfig, ReloadCommand, ReloadError,
    RenderParameters, Template,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEMPLATE: &str = "\
upstream backend {
{{- range .Hosts}}
    server {{.}}:{{$.Port}};
{{- end}}
}
";

fn pods(hosts: &[(&str, &str)]) -> serde_json::Value {
    let items: Vec<_> = hosts
        .iter()
        .map(|(name, ip)| {
            json!({
                "metadata": { "namespace": "default", "name": name },
                "status": { "phase": "Running", "hostIP": ip },
            })
        })
        .collect();
    json!({ "items": items })
}

async fn serve(server: &MockServer, body: serde_json::Value) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/pods"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn reconciler(server: &MockServer, output: &Path, reload: ReloadCommand) -> Reconciler {
    let source = KubernetesSource::new(
        ClusterAccess {
            server: server.uri(),
            certificate_authority: None,
            insecure_skip_tls_verify: false,
            credentials: Credentials::Anonymous,
        },
        Duration::from_secs(5),
    )
    .unwrap();

    let params = RenderParameters {
        template: Template::parse("nginx-template.conf", TEMPLATE).unwrap(),
        port: 32657,
        destination: output.to_path_buf(),
        reload_command: reload,
    };

    Reconciler::new(
        ReconcilerConfig {
            query_timeout: Duration::from_secs(5),
            reload_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        params,
        Arc::new(source),
        Arc::new(FilePublisher::new()),
        Arc::new(CommandReload::new()),
    )
}

/// Reload command that appends a line to `log` on every run.
fn counting_reload(log: &Path) -> ReloadCommand {
    ReloadCommand::new("sh", ["-c".to_string(), format!("echo reload >> {}", log.display())])
}

fn reload_count(log: &Path) -> usize {
    std::fs::read_to_string(log)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_publishes_and_reloads_on_change_only() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("reverse-proxy.conf");
    let log = dir.path().join("reloads.log");

    let server = MockServer::start().await;
    serve(&server, pods(&[("web-1", "10.0.0.2"), ("web-0", "10.0.0.1")])).await;

    let mut reconciler = reconciler(&server, &output, counting_reload(&log));

    let outcome = reconciler.run_once().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Applied { .. }));
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "upstream backend {\n    server 10.0.0.1:32657;\n    server 10.0.0.2:32657;\n}\n"
    );
    assert_eq!(reload_count(&log), 1);

    let outcome = reconciler.run_once().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Unchanged { .. }));
    assert_eq!(reload_count(&log), 1);

    serve(&server, pods(&[("web-0", "10.0.0.1")])).await;
    let outcome = reconciler.run_once().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Applied { .. }));
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "upstream backend {\n    server 10.0.0.1:32657;\n}\n"
    );
    assert_eq!(reload_count(&log), 2);
}

#[tokio::test]
async fn test_empty_pool_leaves_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("reverse-proxy.conf");
    std::fs::write(&output, "previous\n").unwrap();
    let log = dir.path().join("reloads.log");

    let server = MockServer::start().await;
    serve(&server, pods(&[])).await;

    let mut reconciler = reconciler(&server, &output, counting_reload(&log));
    let outcome = reconciler.run_once().await.unwrap();

    assert_eq!(outcome, CycleOutcome::NoEligibleHosts { candidates: 0 });
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "previous\n");
    assert_eq!(reload_count(&log), 0);
}

#[tokio::test]
async fn test_failed_reload_is_retried_without_republishing() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("reverse-proxy.conf");
    let marker = dir.path().join("fail-once");
    std::fs::write(&marker, "").unwrap();

    let server = MockServer::start().await;
    serve(&server, pods(&[("web-0", "10.0.0.1")])).await;

    // Fails while the marker exists and removes it, so the second run succeeds.
    let script = format!(
        "if [ -e {m} ]; then rm {m}; echo 'config test failed' >&2; exit 1; fi",
        m = marker.display()
    );
    let reload = ReloadCommand::new("sh", ["-c".to_string(), script]);
    let mut reconciler = reconciler(&server, &output, reload);

    let err = reconciler.run_once().await.unwrap_err();
    match err {
        CycleError::Reload(ReloadError::Exited {
            exit_code, stderr, ..
        }) => {
            assert_eq!(exit_code, Some(1));
            assert_eq!(stderr.trim(), "config test failed");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(output.exists());
    assert!(reconciler.state().last_published().is_none());

    let modified = std::fs::metadata(&output).unwrap().modified().unwrap();
    let outcome = reconciler.run_once().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::ReloadRetried { .. }));
    assert_eq!(
        std::fs::metadata(&output).unwrap().modified().unwrap(),
        modified
    );
    assert!(reconciler.state().last_published().is_some());
}

#[tokio::test]
async fn test_unwritable_destination_skips_reload() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("missing").join("reverse-proxy.conf");
    let log = dir.path().join("reloads.log");

    let server = MockServer::start().await;
    serve(&server, pods(&[("web-0", "10.0.0.1")])).await;

    let mut reconciler = reconciler(&server, &output, counting_reload(&log));
    let err = reconciler.run_once().await.unwrap_err();

    assert!(matches!(err, CycleError::Publish(_)));
    assert_eq!(reload_count(&log), 0);
    assert!(reconciler.state().last_published().is_none());
}
