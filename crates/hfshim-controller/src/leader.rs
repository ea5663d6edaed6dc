//! Leader election over a coordination.k8s.io/v1 Lease
//!
//! Every write carries the resourceVersion it was computed from, so a lease
//! that changed between read and write fails with a conflict and the attempt
//! counts as "not leader". Only the replica holding the lease runs the
//! VirtualMachine runner.

use crate::error::Result;
use chrono::{DateTime, Utc};
use hfshim_core::{object_meta, Lease, Resource};
use hfshim_storage::StoreClient;
use k8s_openapi::api::coordination::v1::LeaseSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease name shared by all replicas
pub const LEADER_LEASE_NAME: &str = "hf-shim-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderElector {
    client: StoreClient,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// 30s lease, renewed every 10s, acquisition retried every 5s
    pub fn new(client: StoreClient, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_intervals(mut self, renew_interval: Duration, retry_interval: Duration) -> Self {
        self.renew_interval = renew_interval;
        self.retry_interval = retry_interval;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Wait for leadership. Returns `None` if the token is cancelled first.
    pub async fn acquire(self: Arc<Self>, token: CancellationToken) -> Option<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return Some(self.create_guard());
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire lease, retrying"
                    );
                }
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// One compare-and-swap attempt at holding the lease
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let Some(lease) = self
            .client
            .get_opt::<Lease>(&self.namespace, &self.lease_name)
            .await?
        else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_deref()) == Some(self.identity.as_str()) {
            return self.renew_lease(lease, now).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let expired = match (renew_time, duration_secs) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
            _ => true,
        };
        if !expired {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        self.take_over_lease(lease, now, transitions).await
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: object_meta(&self.namespace, &self.lease_name),
            spec: Some(self.held_spec(now, 0)),
        };

        match self.client.create(&lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, mut lease: Lease, now: DateTime<Utc>) -> Result<bool> {
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(now));
        }

        match self.client.update(&lease).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(identity = %self.identity, "Lease renewal conflict, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(&self, mut lease: Lease, now: DateTime<Utc>, transitions: i32) -> Result<bool> {
        lease.spec = Some(self.held_spec(now, transitions + 1));

        match self.client.update(&lease).await {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    self.is_leader.store(false, Ordering::SeqCst);
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder and backdate the renew time so a standby can take over at once
    async fn release_lease(&self) -> Result<()> {
        let Some(mut lease) = self
            .client
            .get_opt::<Lease>(&self.namespace, &self.lease_name)
            .await?
        else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        self.client.update(&lease).await?;

        info!(identity = %self.identity, lease = %lease.name(), "Lease released");
        Ok(())
    }
}

/// Held while this replica is leader. Renewal stops when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give the lease up during graceful shutdown
    pub async fn release(self) -> Result<()> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfshim_storage::{KvResourceStore, RedbBackend};
    use tempfile::TempDir;

    const NS: &str = "hobbyfarm";

    fn make_client() -> (StoreClient, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::new(dir.path().join("leader.redb")).unwrap();
        let store = KvResourceStore::new(Arc::new(backend));
        (StoreClient::new(Arc::new(store)), dir)
    }

    fn elector(client: &StoreClient, identity: &str) -> LeaderElector {
        LeaderElector::new(client.clone(), LEADER_LEASE_NAME, NS, identity)
    }

    async fn holder(client: &StoreClient) -> Option<String> {
        let lease: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();
        lease.spec.and_then(|s| s.holder_identity)
    }

    #[tokio::test]
    async fn test_first_candidate_creates_lease() {
        let (client, _dir) = make_client();
        let first = elector(&client, "replica-a");

        assert!(first.try_acquire_or_renew().await.unwrap());
        assert_eq!(holder(&client).await.as_deref(), Some("replica-a"));

        let lease: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.lease_duration_seconds, Some(30));
        assert_eq!(spec.lease_transitions, Some(0));
    }

    #[tokio::test]
    async fn test_holder_renews_and_other_is_blocked() {
        let (client, _dir) = make_client();
        let first = elector(&client, "replica-a");
        let second = elector(&client, "replica-b");

        assert!(first.try_acquire_or_renew().await.unwrap());
        let before: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();

        assert!(!second.try_acquire_or_renew().await.unwrap());
        assert!(first.try_acquire_or_renew().await.unwrap());

        let after: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();
        assert_ne!(before.resource_version(), after.resource_version());
        assert_eq!(holder(&client).await.as_deref(), Some("replica-a"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (client, _dir) = make_client();
        let stale = Lease {
            metadata: object_meta(NS, LEADER_LEASE_NAME),
            spec: Some(LeaseSpec {
                holder_identity: Some("replica-a".to_string()),
                lease_duration_seconds: Some(30),
                renew_time: Some(MicroTime(Utc::now() - chrono::Duration::seconds(120))),
                lease_transitions: Some(2),
                ..Default::default()
            }),
        };
        client.create(&stale).await.unwrap();

        let second = elector(&client, "replica-b");
        assert!(second.try_acquire_or_renew().await.unwrap());

        let lease: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("replica-b"));
        assert_eq!(spec.lease_transitions, Some(3));
    }

    #[tokio::test]
    async fn test_release_lets_standby_acquire() {
        let (client, _dir) = make_client();
        let first = Arc::new(elector(&client, "replica-a"));
        let guard = first.clone().acquire(CancellationToken::new()).await.unwrap();
        assert!(first.is_leader());

        guard.release().await.unwrap();
        assert!(!first.is_leader());
        assert_eq!(holder(&client).await, None);

        let second = elector(&client, "replica-b");
        assert!(second.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_fires_when_lease_is_stolen() {
        let (client, _dir) = make_client();
        let first = Arc::new(
            elector(&client, "replica-a").with_intervals(Duration::from_millis(20), Duration::from_millis(20)),
        );
        let mut guard = first.clone().acquire(CancellationToken::new()).await.unwrap();

        let mut lease: Lease = client.get(NS, LEADER_LEASE_NAME).await.unwrap();
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = Some("replica-b".to_string());
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        client.update(&lease).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), guard.lost())
            .await
            .expect("leadership loss was not signalled");
        assert!(!first.is_leader());
    }

    #[tokio::test]
    async fn test_acquire_stops_on_cancel() {
        let (client, _dir) = make_client();
        assert!(elector(&client, "replica-a").try_acquire_or_renew().await.unwrap());

        let second = Arc::new(
            elector(&client, "replica-b").with_intervals(Duration::from_millis(20), Duration::from_millis(20)),
        );
        let token = CancellationToken::new();
        token.cancel();
        assert!(second.acquire(token).await.is_none());
    }
}
