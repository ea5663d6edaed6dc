// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod api_client;
pub mod cloudinit;
pub mod deletion;
pub mod error;
pub mod keys;
pub mod leader;
pub mod liveness;
pub mod metrics;
pub mod mock;
pub mod providers;
pub mod reconciler;
pub mod runner;

// Re-export primary types
pub use error::{ControllerError, ErrorClass, Result};
pub use liveness::{LivenessProber, ProbeTarget, SshProber};
pub use mock::{MockProbe, MockProber};
pub use providers::Provider;

// Re-export controller wiring
pub use api_client::HttpResourceStore;
pub use leader::{LeaderElector, LeaderGuard, LEADER_LEASE_NAME};
pub use metrics::ControllerMetrics;
pub use reconciler::{ReconcileOutcome, ReconcilerConfig, VirtualMachineReconciler};
pub use runner::{BackoffPolicy, ControllerRunner, RunnerConfig};
