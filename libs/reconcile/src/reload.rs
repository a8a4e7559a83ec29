//! Reloading the proxy after a publish.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// External command that makes the proxy pick up new configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadCommand {
    program: String,
    args: Vec<String>,
}

impl ReloadCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Default for ReloadCommand {
    fn default() -> Self {
        Self::new("systemctl", ["restart", "nginx"])
    }
}

/// A reload command line that cannot be split into program and arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseReloadCommandError {
    #[error("reload command must not be empty")]
    Empty,

    #[error(
        "reload command must not contain {0:?}: arguments are split on whitespace \
         without shell quoting, put complex commands in a script"
    )]
    Quoted(char),
}

impl FromStr for ReloadCommand {
    type Err = ParseReloadCommandError;

    /// Split on whitespace: the first word is the program.
    ///
    /// There is no shell quoting, so quotes and backslashes are rejected
    /// rather than passed through as literal argument text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(c) = s.chars().find(|c| matches!(c, '\'' | '"' | '\\')) {
            return Err(ParseReloadCommandError::Quoted(c));
        }

        let mut words = s.split_whitespace();
        let program = words.next().ok_or(ParseReloadCommandError::Empty)?;
        Ok(Self::new(program, words))
    }
}

impl fmt::Display for ReloadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Reload errors.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The command ran and reported failure.
    #[error("reload command `{command}` {}: {}", describe_exit(.exit_code), .stderr.trim())]
    Exited {
        command: String,
        /// Exit code, or `None` if the process was killed by a signal.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The command could not be started.
    #[error("failed to run reload command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The command did not finish in time and was killed.
    #[error("reload command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// Invokes the reload action.
#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    async fn reload(&self, command: &ReloadCommand) -> Result<(), ReloadError>;
}
