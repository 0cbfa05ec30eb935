//! Veth datapath CNI plugin for ENI-backed Kubernetes pods
//!
//! This implementation provides a pure Rust veth CNI plugin that:
//! - Creates a veth pair per pod and moves one end into the pod namespace
//! - Routes pods through a synthetic link-local gateway on the host
//! - Steers pods on secondary ENIs into a per-ENI route table with policy rules
//! - Tears everything down again without recorded state

pub mod commands;
pub mod config;
pub mod datapath;
pub mod netns;
pub mod plugin;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni};
pub use config::NetConf;
pub use datapath::{DatapathDriver, DatapathError, ErrorKind, SetupConfig, TeardownConfig};
pub use netns::NetNs;
pub use plugin::VethPlugin;
