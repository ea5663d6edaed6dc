use super::{non_empty, InstanceFacts, InstanceState, Provider, ProvisionContext};
use crate::cloudinit::installer_config;
use crate::error::{ControllerError, Result};
use hfshim_core::equinix::{ImportKeyPair, Instance, ELASTIC_IP_ANNOTATION};
use hfshim_core::{object_meta, set_controller_reference, Resource};
use tracing::info;

pub const DEFAULT_PLAN: &str = "c3.small.x86";
pub const DEFAULT_BILLING_CYCLE: &str = "hourly";
pub const DEFAULT_IPXE_SCRIPT_URL: &str =
    "https://raw.githubusercontent.com/rancher/harvester/master/ipxe/ipxe.txt";
const CUSTOM_IPXE_OS: &str = "custom_ipxe";

/// Instance status once the installer document has been written
pub const PATCHED_STATUS: &str = "patched";

/// Serial-over-SSH console host for a facility
pub fn console_host(facility: &str) -> String {
    format!("sos.{}.platformequinix.com", facility)
}

pub(super) async fn import_key_pair(ctx: &mut ProvisionContext<'_>, public_key: &str) -> Result<String> {
    let cred_secret = ctx.setting(Provider::Metal, "cred_secret")?;

    let vm = &*ctx.vm;
    let key_pair = ImportKeyPair {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (key_pair, result) = ctx
        .client
        .create_or_update(key_pair, |kp: &mut ImportKeyPair| {
            kp.spec.key = public_key.trim().to_string();
            kp.spec.secret = cred_secret.clone();
            set_controller_reference(&mut kp.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("equinix ImportKeyPair {} {:?}", key_pair.name(), result);
    Ok(key_pair.name().to_string())
}

pub(super) async fn launch_instance(ctx: &mut ProvisionContext<'_>) -> Result<()> {
    let cred_secret = ctx.setting(Provider::Metal, "cred_secret")?;
    let metro = ctx.setting(Provider::Metal, "metro")?;
    let iso_url = ctx.setting(Provider::Metal, "iso_url")?;
    let billing_cycle = ctx.setting_or("billing_cycle", DEFAULT_BILLING_CYCLE);
    let ipxe_script_url = ctx.setting_or("ipxe_script_url", DEFAULT_IPXE_SCRIPT_URL);
    let plan = ctx
        .template_setting("instanceType")
        .unwrap_or_else(|| DEFAULT_PLAN.to_string());

    let key_pair_name = ctx.imported_key_pair();
    let key_pair_id = ctx
        .client
        .get_opt::<ImportKeyPair>(ctx.vm.namespace(), &key_pair_name)
        .await?
        .and_then(|kp| non_empty(&kp.status.key_pair_id))
        .ok_or_else(|| ControllerError::not_ready("equinix importKeyPair not yet processed"))?;

    let vm = &*ctx.vm;
    let instance = Instance {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (instance, result) = ctx
        .client
        .create_or_update(instance, |inst: &mut Instance| {
            inst.spec.metro = metro.clone();
            inst.spec.secret = cred_secret.clone();
            inst.spec.os = CUSTOM_IPXE_OS.to_string();
            inst.spec.billing_cycle = billing_cycle.clone();
            inst.spec.ipxe_script_url = ipxe_script_url.clone();
            inst.spec.project_ssh_keys = vec![key_pair_id.clone()];
            inst.spec.plan = plan.clone();
            set_controller_reference(&mut inst.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("equinix Instance {} {:?}", instance.name(), result);
    let progress = &mut ctx.vm.status.provisioning;
    progress.instance_type = Some(plan);
    progress.iso_url = Some(iso_url);
    Ok(())
}

pub(super) async fn fetch_instance(ctx: &mut ProvisionContext<'_>) -> Result<(InstanceState, InstanceFacts)> {
    let instance: Instance = ctx.client.get(ctx.vm.namespace(), ctx.vm.name()).await?;

    let state = match instance.status.status.as_str() {
        "active" => InstanceState::Active,
        "elasticipcreated" => InstanceState::AwaitingBootstrap,
        "" | "queued" | "provisioning" | PATCHED_STATUS => InstanceState::Pending,
        _ => InstanceState::Unknown,
    };

    if state == InstanceState::AwaitingBootstrap {
        patch_instance(ctx, instance).await?;
        return Err(ControllerError::not_ready(
            "equinix instance patched. waiting for it to be ready",
        ));
    }

    let status = &instance.status;
    let facts = InstanceFacts {
        public_ip: non_empty(&status.public_ip),
        private_ip: non_empty(&status.private_ip),
        hostname: non_empty(&status.instance_id),
        instance_id: non_empty(&status.instance_id),
        facility: non_empty(&status.facility),
    };
    Ok((state, facts))
}

/// Hand the installer document to an instance that has its elastic IP
async fn patch_instance(ctx: &mut ProvisionContext<'_>, instance: Instance) -> Result<()> {
    let vip = instance
        .annotation(ELASTIC_IP_ANNOTATION)
        .and_then(non_empty)
        .ok_or_else(|| {
            ControllerError::not_ready(format!(
                "did not find {} annotation on instance {}",
                ELASTIC_IP_ANNOTATION,
                instance.name()
            ))
        })?;

    let iso_url = match ctx.vm.status.provisioning.iso_url.clone() {
        Some(url) => url,
        None => ctx.setting(Provider::Metal, "iso_url")?,
    };
    let hostname = format!("{}-{}", instance.name(), instance.namespace());

    let mut patched = instance;
    patched.spec.user_data = installer_config(&vip, &hostname, &iso_url)?;
    let mut patched = ctx.client.update(&patched).await?;
    patched.status.status = PATCHED_STATUS.to_string();
    ctx.client.update_status(&patched).await?;

    info!("Patched equinix instance {} with installer config for {}", patched.name(), vip);
    Ok(())
}
