use crate::error::Result;
use hfshim_core::{Resource, VirtualMachine, READY_LABEL};
use hfshim_storage::StoreClient;
use tracing::info;

/// What the deletion guard did for a VirtualMachine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Not tainted; provisioning may proceed
    NotApplicable,
    /// Marked not ready and deletion requested
    Deleted,
    /// Deletion already under way; leave the object alone
    AlreadyDeleting,
}

/// Reclaim a tainted VirtualMachine.
///
/// The `ready` label is flipped to `"false"` and that update must land
/// before the delete is issued, so the platform stops routing sessions first.
pub async fn reclaim_if_tainted(client: &StoreClient, vm: &mut VirtualMachine) -> Result<DeletionOutcome> {
    if vm.is_being_deleted() {
        return Ok(DeletionOutcome::AlreadyDeleting);
    }
    if !vm.spec.tainted {
        return Ok(DeletionOutcome::NotApplicable);
    }

    if vm.label(READY_LABEL) != Some("false") {
        vm.set_label(READY_LABEL, "false");
        *vm = client.update(vm).await?;
        info!("Marked tainted VirtualMachine {}/{} not ready", vm.namespace(), vm.name());
    }

    match client.delete::<VirtualMachine>(vm.namespace(), vm.name()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!("Deleted VirtualMachine {}/{}", vm.namespace(), vm.name());
    Ok(DeletionOutcome::Deleted)
}
