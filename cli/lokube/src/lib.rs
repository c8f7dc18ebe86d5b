//! lokube - local single-node Kubernetes clusters.
//!
//! `lokube start` turns a machine (a VM, or the local host with the `none`
//! driver) into a running cluster: it persists the profile, provisions the
//! host with bounded retries, keeps exactly one container runtime active,
//! bootstraps the control plane, writes kubeconfig and verifies health.
//!
//! ## Modules
//!
//! - `sequencer`: the ordered start pipeline and its failure policy
//! - `backend`: collaborator traits plus the no-VM and kubeadm implementations
//! - `runtime`: container runtime selection
//! - `version_guard`: Kubernetes downgrade protection
//! - `kubeconfig`: kubeconfig merge and write
//! - `mount`: mount helper spawn and PID record
//! - `ownership`: no-VM home directory ownership fix-up

pub mod backend;
pub mod commands;
pub mod error;
pub mod kubeconfig;
pub mod logging;
pub mod mount;
pub mod options;
pub mod ownership;
pub mod paths;
pub mod runtime;
pub mod sequencer;
pub mod version_guard;

pub use error::StartError;
pub use options::{ClusterOptions, StartOptions};
pub use sequencer::{ClusterAction, Sequencer, StartOutcome};
