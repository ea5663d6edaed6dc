use crate::deletion::{reclaim_if_tainted, DeletionOutcome};
use crate::error::{ControllerError, Result};
use crate::keys;
use crate::liveness::LivenessProber;
use crate::providers::{non_empty, Provider, ProvisionContext};
use hfshim_core::{
    Environment, Phase, Resource, VirtualMachine, VirtualMachineTemplate, READY_LABEL,
};
use hfshim_storage::StoreClient;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reconciler settings
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    /// Namespace Environments and VirtualMachineTemplates are read from.
    /// Defaults to the VirtualMachine's own namespace.
    pub catalog_namespace: Option<String>,
}

/// What a reconcile pass concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left to do until the object changes
    Done,
    /// The phase advanced; run again to continue
    Requeue,
    /// The VirtualMachine was reclaimed
    Deleted,
    /// Object absent, already deleting, or in a phase this controller does not own
    Ignored,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Done => "done",
            ReconcileOutcome::Requeue => "requeue",
            ReconcileOutcome::Deleted => "deleted",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}

/// Drives VirtualMachines through provisioning, one phase per pass
pub struct VirtualMachineReconciler {
    client: StoreClient,
    prober: Arc<dyn LivenessProber>,
    config: ReconcilerConfig,
}

impl VirtualMachineReconciler {
    pub fn new(client: StoreClient, prober: Arc<dyn LivenessProber>, config: ReconcilerConfig) -> Self {
        Self {
            client,
            prober,
            config,
        }
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    /// Run one pass for the VirtualMachine `namespace/name`
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome> {
        let key = format!("{}/{}", namespace, name);
        let Some(mut vm) = self.client.get_opt::<VirtualMachine>(namespace, name).await? else {
            debug!(vm = %key, "VirtualMachine gone, skipping");
            return Ok(ReconcileOutcome::Ignored);
        };

        match reclaim_if_tainted(&self.client, &mut vm).await? {
            DeletionOutcome::Deleted => return Ok(ReconcileOutcome::Deleted),
            DeletionOutcome::AlreadyDeleting => return Ok(ReconcileOutcome::Ignored),
            DeletionOutcome::NotApplicable => {}
        }

        let phase = vm.status.phase;
        match phase {
            Phase::Running | Phase::Error => return Ok(ReconcileOutcome::Done),
            Phase::Unknown => {
                debug!(vm = %key, "Phase not owned by this controller");
                return Ok(ReconcileOutcome::Ignored);
            }
            _ => {}
        }

        let original = vm.clone();

        if let Some(field) = vm.missing_request_field() {
            warn!(vm = %key, "{} is empty, marking VirtualMachine failed", field);
            vm.status.phase = Phase::Error;
            vm.status.message = Some(format!("{} must not be empty", field));
            self.persist(&original, &mut vm).await?;
            return Ok(ReconcileOutcome::Done);
        }

        match self.advance(&mut vm).await {
            Ok(next) => {
                vm.status.phase = next;
                vm.status.message = None;
                self.persist(&original, &mut vm).await?;
                info!(vm = %key, from = %phase, to = %next, "Phase advanced");
                Ok(if next == Phase::Running {
                    ReconcileOutcome::Done
                } else {
                    ReconcileOutcome::Requeue
                })
            }
            Err(e) => {
                vm.status.message = Some(e.to_string());
                if let Err(persist_err) = self.persist(&original, &mut vm).await {
                    warn!(
                        vm = %key,
                        "Failed to record progress after error: {}", persist_err
                    );
                }
                Err(e)
            }
        }
    }

    /// Perform the action for the current phase and return the next phase
    async fn advance(&self, vm: &mut VirtualMachine) -> Result<Phase> {
        match vm.status.phase {
            Phase::ReadyForProvisioning => {
                keys::ensure_credential_secret(&self.client, vm).await?;
                vm.spec.key_pair = keys::secret_name(vm.name());
                vm.status.provisioning.secret_created = true;
                Ok(Phase::SecretCreated)
            }
            Phase::SecretCreated => {
                let (environment, template) = self.catalog(vm).await?;
                let provider = Provider::resolve(&environment)?;
                let public_key = keys::public_key(&self.client, vm).await?;
                let mut ctx = self.context(vm, &environment, &template);
                provider.import_key_pair(&mut ctx, &public_key).await?;
                Ok(Phase::ImportKeyPairCreated)
            }
            Phase::ImportKeyPairCreated => {
                let (environment, template) = self.catalog(vm).await?;
                let provider = recorded_provider(vm, &environment)?;
                let mut ctx = self.context(vm, &environment, &template);
                provider.launch_instance(&mut ctx).await?;
                vm.status.ws_endpoint = non_empty(&environment.spec.ws_endpoint);
                Ok(Phase::Provisioned)
            }
            Phase::Provisioned => {
                let (environment, template) = self.catalog(vm).await?;
                let provider = recorded_provider(vm, &environment)?;
                let mut ctx = self.context(vm, &environment, &template);
                let fetched = provider.fetch_instance(&mut ctx).await?;
                if !fetched.reachable {
                    return Err(ControllerError::not_ready("VM still not running"));
                }
                vm.set_label(READY_LABEL, "true");
                Ok(Phase::Running)
            }
            other => Err(ControllerError::internal_error(format!(
                "no action for phase {}",
                other
            ))),
        }
    }

    fn context<'a>(
        &'a self,
        vm: &'a mut VirtualMachine,
        environment: &'a Environment,
        template: &'a VirtualMachineTemplate,
    ) -> ProvisionContext<'a> {
        ProvisionContext {
            client: &self.client,
            prober: self.prober.as_ref(),
            vm,
            environment,
            template,
        }
    }

    async fn catalog(&self, vm: &VirtualMachine) -> Result<(Environment, VirtualMachineTemplate)> {
        let namespace = self
            .config
            .catalog_namespace
            .as_deref()
            .unwrap_or(vm.namespace());

        let environment = self
            .client
            .get_opt::<Environment>(namespace, &vm.spec.environment_id)
            .await?
            .ok_or_else(|| ControllerError::missing_reference("Environment", &vm.spec.environment_id))?;
        let template = self
            .client
            .get_opt::<VirtualMachineTemplate>(namespace, &vm.spec.vm_template_id)
            .await?
            .ok_or_else(|| {
                ControllerError::missing_reference("VirtualMachineTemplate", &vm.spec.vm_template_id)
            })?;
        Ok((environment, template))
    }

    /// Write metadata and spec first, then status against the fresh resourceVersion
    async fn persist(&self, original: &VirtualMachine, vm: &mut VirtualMachine) -> Result<()> {
        if vm.metadata != original.metadata || vm.spec != original.spec {
            let updated = self.client.update(vm).await?;
            vm.metadata = updated.metadata;
            vm.spec = updated.spec;
        }
        if vm.status != original.status {
            let updated = self.client.update_status(vm).await?;
            vm.metadata = updated.metadata;
        }
        Ok(())
    }
}

fn recorded_provider(vm: &VirtualMachine, environment: &Environment) -> Result<Provider> {
    match vm.status.provisioning.provider {
        Some(kind) => Ok(Provider::for_kind(kind)),
        None => Provider::resolve(environment),
    }
}
