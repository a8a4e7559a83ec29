//! Test doubles for the reconciliation loop.
//!
//! Each fake records how it was called and can be scripted to fail or hang,
//! so tests can drive the loop through every branch without a cluster, a
//! proxy or a writable `/etc`.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use upsync_reconcile::{
    Instance, MembershipError, MembershipSource, Phase, PublishError, Publisher, ReloadCommand,
    ReloadError, ReloadTrigger, RenderedConfig,
};

/// A running instance on `host`.
pub fn running(identity: &str, host: &str) -> Instance {
    Instance::new(identity, Some(host), Phase::Running)
}

/// An instance in `phase` on `host`.
pub fn instance(identity: &str, host: &str, phase: Phase) -> Instance {
    Instance::new(identity, Some(host), phase)
}

/// Membership source returning a settable list of instances.
#[derive(Default)]
pub struct FakeMembership {
    instances: Mutex<Vec<Instance>>,
    failures: Mutex<VecDeque<String>>,
    hang: AtomicBool,
    calls: AtomicUsize,
    selectors: Mutex<Vec<String>>,
}

impl FakeMembership {
    pub fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances: Mutex::new(instances),
            ..Default::default()
        }
    }

    /// Replace the instances returned from now on.
    pub fn set_instances(&self, instances: Vec<Instance>) {
        *self.instances.lock().unwrap() = instances;
    }

    /// Make the next query fail with `message`.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().unwrap().push_back(message.to_string());
    }

    /// Make every query block until cancelled.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Selectors passed to each query, in order.
    pub fn selectors(&self) -> Vec<String> {
        self.selectors.lock().unwrap().clone()
    }
}

#[async_trait]
impl MembershipSource for FakeMembership {
    async fn list_candidates(&self, selector: &str) -> Result<Vec<Instance>, MembershipError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.selectors.lock().unwrap().push(selector.to_string());

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if let Some(message) = self.failures.lock().unwrap().pop_front() {
            return Err(MembershipError::new(message));
        }

        Ok(self.instances.lock().unwrap().clone())
    }
}

/// A publish the fake publisher accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination: PathBuf,
    pub text: String,
}

/// Publisher that keeps every published configuration in memory.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make publishes fail with a permission error until reset.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Calls made, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful publishes, in order.
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Text of the most recent successful publish.
    pub fn last_text(&self) -> Option<String> {
        self.published.lock().unwrap().last().map(|p| p.text.clone())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(
        &self,
        rendered: &RenderedConfig,
        destination: &Path,
    ) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::new(
                "write",
                destination,
                io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
            ));
        }

        self.published.lock().unwrap().push(Published {
            destination: destination.to_path_buf(),
            text: rendered.as_str().to_string(),
        });
        Ok(())
    }
}

/// Scripted result of one reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadScript {
    Succeed,
    Exit { code: i32, stderr: String },
    Hang,
}

/// Reload trigger that plays back scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedReload {
    script: Mutex<VecDeque<ReloadScript>>,
    calls: AtomicUsize,
    successes: AtomicUsize,
}

impl ScriptedReload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of a future reload.
    pub fn push(&self, step: ReloadScript) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Make the next reload exit with `code` and `stderr`.
    pub fn fail_next(&self, code: i32, stderr: &str) {
        self.push(ReloadScript::Exit {
            code,
            stderr: stderr.to_string(),
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadTrigger for ScriptedReload {
    async fn reload(&self, command: &ReloadCommand) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ReloadScript::Succeed);

        match step {
            ReloadScript::Succeed => {
                self.successes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            ReloadScript::Exit { code, stderr } => Err(ReloadError::Exited {
                command: command.to_string(),
                exit_code: Some(code),
                stderr,
            }),
            ReloadScript::Hang => std::future::pending().await,
        }
    }
}
