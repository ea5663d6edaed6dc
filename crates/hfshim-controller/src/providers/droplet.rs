use super::{non_empty, InstanceFacts, InstanceState, Provider, ProvisionContext};
use crate::error::{ControllerError, Result};
use hfshim_core::droplet::{DropletImage, DropletSshKey, ImportKeyPair, Instance};
use hfshim_core::{object_meta, set_controller_reference, Resource};
use tracing::info;

pub const DEFAULT_SIZE: &str = "s-1vcpu-1gb";

pub(super) async fn import_key_pair(ctx: &mut ProvisionContext<'_>, public_key: &str) -> Result<String> {
    let cred_secret = ctx.setting(Provider::Droplet, "cred_secret")?;

    let vm = &*ctx.vm;
    let key_pair = ImportKeyPair {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (key_pair, result) = ctx
        .client
        .create_or_update(key_pair, |kp: &mut ImportKeyPair| {
            kp.spec.public_key = public_key.trim().to_string();
            kp.spec.secret = cred_secret.clone();
            set_controller_reference(&mut kp.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("droplet ImportKeyPair {} {:?}", key_pair.name(), result);
    Ok(key_pair.name().to_string())
}

pub(super) async fn launch_instance(ctx: &mut ProvisionContext<'_>) -> Result<()> {
    let cred_secret = ctx.setting(Provider::Droplet, "cred_secret")?;
    let region = ctx.setting(Provider::Droplet, "region")?;
    let slug = ctx.required_template_setting("image")?;
    let size = ctx
        .template_setting("instanceType")
        .unwrap_or_else(|| DEFAULT_SIZE.to_string());
    let user_data = ctx.template_setting("cloudInit").unwrap_or_default();
    let vpc_uuid = ctx.template_setting("vpcUuid").unwrap_or_default();
    let backups = ctx.template_flag("backup");
    let ipv6 = ctx.template_flag("ipv6");
    let private_networking = ctx.template_flag("privateNetworking");

    let key_pair_name = ctx.imported_key_pair();
    let ssh_key = ctx
        .client
        .get_opt::<ImportKeyPair>(ctx.vm.namespace(), &key_pair_name)
        .await?
        .filter(|kp| kp.status.id != 0 && !kp.status.fingerprint.is_empty())
        .map(|kp| DropletSshKey {
            id: kp.status.id,
            fingerprint: kp.status.fingerprint,
        })
        .ok_or_else(|| ControllerError::not_ready("droplet importKeyPair not yet processed"))?;

    let vm = &*ctx.vm;
    let instance = Instance {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (instance, result) = ctx
        .client
        .create_or_update(instance, |inst: &mut Instance| {
            inst.spec.name = vm.name().to_string();
            inst.spec.secret = cred_secret.clone();
            inst.spec.region = region.clone();
            inst.spec.size = size.clone();
            inst.spec.image = DropletImage { slug: slug.clone() };
            inst.spec.ssh_keys = vec![ssh_key.clone()];
            inst.spec.user_data = user_data.clone();
            inst.spec.backups = backups;
            inst.spec.ipv6 = ipv6;
            inst.spec.private_networking = private_networking;
            inst.spec.vpc_uuid = vpc_uuid.clone();
            set_controller_reference(&mut inst.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("droplet Instance {} {:?}", instance.name(), result);
    ctx.vm.status.provisioning.instance_type = Some(size);
    Ok(())
}

pub(super) async fn fetch_instance(ctx: &mut ProvisionContext<'_>) -> Result<(InstanceState, InstanceFacts)> {
    let instance: Instance = ctx.client.get(ctx.vm.namespace(), ctx.vm.name()).await?;
    let status = &instance.status;

    let state = match status.status.as_str() {
        "provisioned" | "active" => InstanceState::Active,
        "" | "new" => InstanceState::Pending,
        _ => InstanceState::Unknown,
    };
    let instance_id = (status.instance_id > 0).then(|| status.instance_id.to_string());
    let facts = InstanceFacts {
        public_ip: non_empty(&status.public_ip),
        private_ip: non_empty(&status.private_ip),
        hostname: instance_id.as_ref().map(|_| instance.name().to_string()),
        instance_id,
        facility: None,
    };
    Ok((state, facts))
}
