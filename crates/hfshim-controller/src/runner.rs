use crate::error::{ErrorClass, Result};
use crate::metrics::ControllerMetrics;
use crate::reconciler::{ReconcileOutcome, VirtualMachineReconciler};
use futures_util::stream::{self, StreamExt};
use hfshim_core::{Phase, Resource, VirtualMachine};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry delays after a failed reconcile pass
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay for not-ready, store and fatal errors
    pub base: Duration,
    /// Upper bound for the exponential schedule
    pub max: Duration,
    /// Flat delay for configuration errors
    pub configuration: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            configuration: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, class: ErrorClass, attempt: u32) -> Duration {
        if class == ErrorClass::Configuration {
            return self.configuration;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Runner settings
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Namespace VirtualMachines are listed from
    pub namespace: String,
    /// Maximum reconcile passes in flight per tick
    pub threads: usize,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            namespace: "hobbyfarm".to_string(),
            threads: 5,
            poll_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    attempts: u32,
    retry_at: Instant,
}

/// Lists VirtualMachines on an interval and reconciles the ones with work left
pub struct ControllerRunner {
    reconciler: Arc<VirtualMachineReconciler>,
    metrics: Arc<ControllerMetrics>,
    config: RunnerConfig,
    backoff: Mutex<HashMap<String, Backoff>>,
}

impl ControllerRunner {
    pub fn new(
        reconciler: Arc<VirtualMachineReconciler>,
        metrics: Arc<ControllerMetrics>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            reconciler,
            metrics,
            config,
            backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Run the polling loop until the token is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            namespace = %self.config.namespace,
            threads = self.config.threads,
            "Starting VirtualMachine runner (interval: {:?})",
            self.config.poll_interval
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("VirtualMachine runner shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Runner tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// List once and reconcile every eligible key at most once
    pub async fn tick(&self) -> Result<()> {
        let vms: Vec<VirtualMachine> = self.reconciler.client().list(&self.config.namespace).await?;
        let now = Instant::now();

        let pending: HashSet<String> = vms
            .iter()
            .filter(|vm| needs_reconcile(vm))
            .map(|vm| format!("{}/{}", vm.namespace(), vm.name()))
            .collect();

        let mut due = Vec::new();
        {
            let mut backoff = self.backoff.lock().await;
            // Deleted or settled VMs are never listed as pending again
            backoff.retain(|key, _| pending.contains(key));
            for vm in vms.iter().filter(|vm| needs_reconcile(vm)) {
                let key = format!("{}/{}", vm.namespace(), vm.name());
                match backoff.get(&key) {
                    Some(b) if b.retry_at > now => {
                        debug!(vm = %key, "In backoff, skipping");
                    }
                    _ => due.push((vm.namespace().to_string(), vm.name().to_string())),
                }
            }
        }

        debug!("Reconciling {} of {} VirtualMachines", due.len(), vms.len());
        stream::iter(due)
            .for_each_concurrent(self.config.threads.max(1), |(namespace, name)| async move {
                self.reconcile_one(&namespace, &name).await;
            })
            .await;
        Ok(())
    }

    async fn reconcile_one(&self, namespace: &str, name: &str) {
        let key = format!("{}/{}", namespace, name);
        let started = std::time::Instant::now();
        let result = self.reconciler.reconcile(namespace, name).await;
        self.metrics.observe_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                self.metrics.record_outcome(outcome);
                self.backoff.lock().await.remove(&key);
                if outcome == ReconcileOutcome::Requeue {
                    debug!(vm = %key, "Requeued for next tick");
                }
            }
            Err(e) => {
                let class = e.class();
                self.metrics.record_error(class);

                let mut backoff = self.backoff.lock().await;
                let attempts = backoff.get(&key).map_or(0, |b| b.attempts) + 1;
                let delay = self.config.backoff.delay(class, attempts);
                backoff.insert(
                    key.clone(),
                    Backoff {
                        attempts,
                        retry_at: Instant::now() + delay,
                    },
                );

                match class {
                    ErrorClass::NotReady => {
                        debug!(vm = %key, attempts, "Not ready, retrying in {:?}: {}", delay, e)
                    }
                    ErrorClass::Configuration => {
                        error!(vm = %key, class = class.as_str(), "Retrying in {:?}: {}", delay, e)
                    }
                    ErrorClass::Store | ErrorClass::Fatal => {
                        warn!(vm = %key, class = class.as_str(), attempts, "Retrying in {:?}: {}", delay, e)
                    }
                }
            }
        }
    }
}

/// Whether a pass could change anything for this VirtualMachine
fn needs_reconcile(vm: &VirtualMachine) -> bool {
    if vm.is_being_deleted() {
        return false;
    }
    if vm.spec.tainted {
        return true;
    }
    !matches!(vm.status.phase, Phase::Running | Phase::Error | Phase::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProber;
    use crate::reconciler::ReconcilerConfig;
    use hfshim_storage::{KvResourceStore, RedbBackend, StoreClient};
    use tempfile::TempDir;

    fn make_runner() -> (ControllerRunner, StoreClient, Arc<ControllerMetrics>, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::new(dir.path().join("runner.redb")).unwrap();
        let client = StoreClient::new(Arc::new(KvResourceStore::new(Arc::new(backend))));
        let reconciler = Arc::new(VirtualMachineReconciler::new(
            client.clone(),
            Arc::new(MockProber::healthy()),
            ReconcilerConfig::default(),
        ));
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let runner = ControllerRunner::new(reconciler, metrics.clone(), RunnerConfig::default());
        (runner, client, metrics, dir)
    }

    fn request(name: &str) -> VirtualMachine {
        let mut vm = VirtualMachine::new("hobbyfarm", name);
        vm.spec.environment_id = "missing-env".to_string();
        vm.spec.vm_template_id = "ubuntu".to_string();
        vm
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(ErrorClass::NotReady, 1), Duration::from_secs(1));
        assert_eq!(policy.delay(ErrorClass::NotReady, 2), Duration::from_secs(2));
        assert_eq!(policy.delay(ErrorClass::Store, 4), Duration::from_secs(8));
        assert_eq!(policy.delay(ErrorClass::NotReady, 7), Duration::from_secs(60));
        assert_eq!(policy.delay(ErrorClass::Fatal, 200), Duration::from_secs(60));
        assert_eq!(policy.delay(ErrorClass::Configuration, 1), Duration::from_secs(300));
        assert_eq!(policy.delay(ErrorClass::Configuration, 9), Duration::from_secs(300));
    }

    #[test]
    fn test_needs_reconcile() {
        let mut vm = request("vm-1");
        assert!(needs_reconcile(&vm));

        vm.status.phase = Phase::Running;
        assert!(!needs_reconcile(&vm));

        vm.spec.tainted = true;
        assert!(needs_reconcile(&vm));

        vm.status.phase = Phase::Unknown;
        assert!(needs_reconcile(&vm));

        vm.spec.tainted = false;
        assert!(!needs_reconcile(&vm));
    }

    #[tokio::test]
    async fn test_tick_advances_pending_vm() {
        let (runner, client, metrics, _dir) = make_runner();
        client.create(&request("vm-1")).await.unwrap();

        runner.tick().await.unwrap();

        let vm: VirtualMachine = client.get("hobbyfarm", "vm-1").await.unwrap();
        assert_eq!(vm.status.phase, Phase::SecretCreated);
        assert!(metrics.render().contains("hfshim_reconcile_total{outcome=\"requeue\"} 1"));
    }

    #[tokio::test]
    async fn test_configuration_error_backs_off() {
        let (runner, client, metrics, _dir) = make_runner();
        let mut vm = client.create(&request("vm-1")).await.unwrap();
        vm.status.phase = Phase::SecretCreated;
        client.update_status(&vm).await.unwrap();

        runner.tick().await.unwrap();
        runner.tick().await.unwrap();

        let text = metrics.render();
        assert!(text.contains("hfshim_reconcile_errors_total{class=\"configuration\"} 1"));
        let vm: VirtualMachine = client.get("hobbyfarm", "vm-1").await.unwrap();
        assert_eq!(vm.status.phase, Phase::SecretCreated);
        assert!(vm.status.message.is_some());
    }

    #[tokio::test]
    async fn test_backoff_entry_dropped_after_vm_deleted() {
        let (runner, client, metrics, _dir) = make_runner();
        let mut vm = client.create(&request("vm-1")).await.unwrap();
        vm.status.phase = Phase::SecretCreated;
        client.update_status(&vm).await.unwrap();

        runner.tick().await.unwrap();
        assert_eq!(runner.backoff.lock().await.len(), 1);
        assert!(metrics.render().contains("hfshim_reconcile_errors_total{class=\"configuration\"} 1"));

        client.delete::<VirtualMachine>("hobbyfarm", "vm-1").await.unwrap();
        runner.tick().await.unwrap();
        assert!(runner.backoff.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_backoff_entry_dropped_once_vm_settles() {
        let (runner, client, _metrics, _dir) = make_runner();
        let mut vm = client.create(&request("vm-1")).await.unwrap();
        vm.status.phase = Phase::SecretCreated;
        client.update_status(&vm).await.unwrap();

        runner.tick().await.unwrap();
        assert!(runner.backoff.lock().await.contains_key("hobbyfarm/vm-1"));

        let mut vm: VirtualMachine = client.get("hobbyfarm", "vm-1").await.unwrap();
        vm.status.phase = Phase::Error;
        client.update_status(&vm).await.unwrap();
        runner.tick().await.unwrap();
        assert!(runner.backoff.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_running_vm_is_skipped() {
        let (runner, client, metrics, _dir) = make_runner();
        let mut vm = client.create(&request("vm-1")).await.unwrap();
        vm.status.phase = Phase::Running;
        client.update_status(&vm).await.unwrap();

        runner.tick().await.unwrap();
        assert!(!metrics.render().contains("hfshim_reconcile_total"));
    }
}
