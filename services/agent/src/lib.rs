//! upsync agent
//!
//! Keeps a reverse proxy's upstream configuration in sync with the pods
//! matching a label selector.
//!
//! This crate provides the concrete collaborators of the reconciliation loop:
//! - [`KubernetesSource`] lists pods from the API server
//! - [`FilePublisher`] atomically replaces the proxy configuration file
//! - [`CommandReload`] runs the proxy's reload command

pub mod config;
pub mod kubernetes;
pub mod publish;
pub mod reload;

pub use config::Config;
pub use kubernetes::{ClusterAccess, Credentials, KubernetesSource};
pub use publish::FilePublisher;
pub use reload::CommandReload;
