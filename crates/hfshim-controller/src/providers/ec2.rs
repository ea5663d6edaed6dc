use super::{non_empty, InstanceFacts, InstanceState, Provider, ProvisionContext};
use crate::cloudinit::{encode_base64, merge_authorized_key};
use crate::error::{ControllerError, Result};
use crate::keys;
use hfshim_core::ec2::{ImportKeyPair, Instance};
use hfshim_core::{object_meta, set_controller_reference, Resource};
use tracing::info;

pub const DEFAULT_INSTANCE_TYPE: &str = "t2.medium";

pub(super) async fn import_key_pair(ctx: &mut ProvisionContext<'_>, public_key: &str) -> Result<String> {
    let cred_secret = ctx.setting(Provider::Ec2, "cred_secret")?;
    let region = ctx.setting(Provider::Ec2, "region")?;

    let vm = &*ctx.vm;
    let key_pair = ImportKeyPair {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (key_pair, result) = ctx
        .client
        .create_or_update(key_pair, |kp: &mut ImportKeyPair| {
            kp.spec.public_key = public_key.trim().to_string();
            kp.spec.key_name = vm.name().to_string();
            kp.spec.secret = cred_secret.clone();
            kp.spec.region = region.clone();
            set_controller_reference(&mut kp.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("ec2 ImportKeyPair {} {:?}", key_pair.name(), result);
    Ok(key_pair.name().to_string())
}

pub(super) async fn launch_instance(ctx: &mut ProvisionContext<'_>) -> Result<()> {
    let cred_secret = ctx.setting(Provider::Ec2, "cred_secret")?;
    let region = ctx.setting(Provider::Ec2, "region")?;
    let subnet = ctx.setting(Provider::Ec2, "subnet")?;
    let security_group = ctx.setting(Provider::Ec2, "vpc_security_group_id")?;
    let image = ctx.required_template_setting("image")?;
    let instance_type = ctx
        .template_setting("instanceType")
        .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string());

    let key_pair_name = ctx.imported_key_pair();
    let key_pair = ctx
        .client
        .get_opt::<ImportKeyPair>(ctx.vm.namespace(), &key_pair_name)
        .await?
        .filter(|kp| !kp.status.key_pair_id.is_empty())
        .ok_or_else(|| ControllerError::not_ready("ec2 importKeyPair not yet processed"))?;

    let public_key = keys::public_key(ctx.client, ctx.vm).await?;
    let cloud_init = ctx.template_setting("cloudInit").unwrap_or_default();
    let user_data = encode_base64(&merge_authorized_key(&cloud_init, &public_key)?.render()?);

    let vm = &*ctx.vm;
    let instance = Instance {
        metadata: object_meta(vm.namespace(), vm.name()),
        ..Default::default()
    };
    let (instance, result) = ctx
        .client
        .create_or_update(instance, |inst: &mut Instance| {
            inst.spec.secret = cred_secret.clone();
            inst.spec.subnet_id = subnet.clone();
            inst.spec.image_id = image.clone();
            inst.spec.region = region.clone();
            inst.spec.user_data = user_data.clone();
            inst.spec.security_group_ids = vec![security_group.clone()];
            inst.spec.instance_type = instance_type.clone();
            inst.spec.public_ip_address = true;
            inst.spec.key_name = key_pair.spec.key_name.clone();
            set_controller_reference(&mut inst.metadata, vm)?;
            Ok(())
        })
        .await?;

    info!("ec2 Instance {} {:?}", instance.name(), result);
    ctx.vm.status.provisioning.instance_type = Some(instance_type);
    Ok(())
}

pub(super) async fn fetch_instance(ctx: &mut ProvisionContext<'_>) -> Result<(InstanceState, InstanceFacts)> {
    let instance: Instance = ctx.client.get(ctx.vm.namespace(), ctx.vm.name()).await?;
    let status = &instance.status;

    let state = match status.status.as_str() {
        "provisioned" | "running" => InstanceState::Active,
        "" | "pending" => InstanceState::Pending,
        _ => InstanceState::Unknown,
    };
    let facts = InstanceFacts {
        public_ip: non_empty(&status.public_ip),
        private_ip: non_empty(&status.private_ip),
        hostname: non_empty(&status.instance_id),
        instance_id: non_empty(&status.instance_id),
        facility: None,
    };
    Ok((state, facts))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::mock::MockProbe;
    use hfshim_core::Environment;

    fn environment() -> Environment {
        Environment::new(NAMESPACE, "aws-east", "ec2")
            .with_specific("cred_secret", "aws-creds")
            .with_specific("region", "us-east-1")
            .with_specific("subnet", "subnet-1")
            .with_specific("vpc_security_group_id", "sg-1")
            .with_template_setting(TEMPLATE, "image", "ami-123")
            .with_template_setting(TEMPLATE, "cloudInit", "#cloud-config\npackages:\n  - git\n")
    }

    async fn set_key_pair_id(fixture: &Fixture, id: &str) {
        let mut kp: ImportKeyPair = fixture.client.get(NAMESPACE, "vm-1").await.unwrap();
        kp.status.key_pair_id = id.to_string();
        fixture.client.update_status(&kp).await.unwrap();
    }

    #[tokio::test]
    async fn test_import_key_pair_requires_cred_secret() {
        let env = Environment::new(NAMESPACE, "aws-east", "ec2").with_specific("region", "us-east-1");
        let mut fixture = Fixture::new(env).await;

        let err = Provider::Ec2
            .import_key_pair(&mut fixture.ctx(), "ssh-ed25519 AAAA")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::MissingSetting { .. }));
        assert!(fixture.client.list::<ImportKeyPair>(NAMESPACE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_key_pair_requires_region() {
        let env = Environment::new(NAMESPACE, "aws-east", "ec2").with_specific("cred_secret", "aws-creds");
        let mut fixture = Fixture::new(env).await;

        let err = Provider::Ec2
            .import_key_pair(&mut fixture.ctx(), "ssh-ed25519 AAAA")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("region"));
        assert!(fixture.client.list::<ImportKeyPair>(NAMESPACE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_key_pair_writes_child() {
        let mut fixture = Fixture::new(environment()).await;
        Provider::Ec2
            .import_key_pair(&mut fixture.ctx(), "ssh-ed25519 AAAA\n")
            .await
            .unwrap();

        let kp: ImportKeyPair = fixture.client.get(NAMESPACE, "vm-1").await.unwrap();
        assert_eq!(kp.spec.public_key, "ssh-ed25519 AAAA");
        assert_eq!(kp.spec.key_name, "vm-1");
        assert_eq!(kp.spec.region, "us-east-1");
        assert!(hfshim_core::is_owned_by(&kp.metadata, &fixture.vm.uid().unwrap()));
        assert_eq!(fixture.vm.status.provisioning.imported_key_pair.as_deref(), Some("vm-1"));
    }

    #[tokio::test]
    async fn test_launch_waits_for_key_pair_id() {
        let mut fixture = Fixture::new(environment()).await;
        Provider::Ec2
            .import_key_pair(&mut fixture.ctx(), "ssh-ed25519 AAAA")
            .await
            .unwrap();

        let err = Provider::Ec2.launch_instance(&mut fixture.ctx()).await.unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::NotReady);
        assert!(fixture.client.list::<Instance>(NAMESPACE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_launch_instance_spec() {
        let mut fixture = Fixture::new(environment()).await;
        Provider::Ec2
            .import_key_pair(&mut fixture.ctx(), "ssh-ed25519 AAAA")
            .await
            .unwrap();
        set_key_pair_id(&fixture, "key-0abc").await;

        Provider::Ec2.launch_instance(&mut fixture.ctx()).await.unwrap();

        let instance: Instance = fixture.client.get(NAMESPACE, "vm-1").await.unwrap();
        assert_eq!(instance.spec.image_id, "ami-123");
        assert_eq!(instance.spec.instance_type, DEFAULT_INSTANCE_TYPE);
        assert_eq!(instance.spec.security_group_ids, vec!["sg-1".to_string()]);
        assert!(instance.spec.public_ip_address);
        assert_eq!(instance.spec.key_name, "vm-1");

        let user_data = crate::cloudinit::CloudConfig::parse(&instance.spec.user_data).unwrap();
        let public_key = keys::public_key(&fixture.client, &fixture.vm).await.unwrap();
        assert_eq!(user_data.authorized_keys(), vec![public_key]);
        assert!(user_data.get("packages").is_some());
        assert_eq!(
            fixture.vm.status.provisioning.instance_type.as_deref(),
            Some(DEFAULT_INSTANCE_TYPE)
        );
    }

    #[tokio::test]
    async fn test_fetch_probes_provisioned_instance() {
        let mut fixture = Fixture::new(environment()).await;
        let mut instance = Instance {
            metadata: object_meta(NAMESPACE, "vm-1"),
            ..Default::default()
        };
        set_controller_reference(&mut instance.metadata, &fixture.vm).unwrap();
        let mut instance = fixture.client.create(&instance).await.unwrap();
        instance.status.status = "provisioned".to_string();
        instance.status.public_ip = "203.0.113.5".to_string();
        instance.status.private_ip = "10.0.0.5".to_string();
        instance.status.instance_id = "i-0abc".to_string();
        fixture.client.update_status(&instance).await.unwrap();

        fixture.prober.push([MockProbe::Exit(true)]).await;
        let fetched = Provider::Ec2.fetch_instance(&mut fixture.ctx()).await.unwrap();

        assert_eq!(fetched.state, InstanceState::Active);
        assert!(fetched.reachable);
        assert_eq!(fixture.vm.status.public_ip.as_deref(), Some("203.0.113.5"));
        assert_eq!(fixture.vm.status.hostname.as_deref(), Some("i-0abc"));

        let calls = fixture.prober.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address, "203.0.113.5:22");
        assert_eq!(calls[0].username, "ubuntu");
        assert_eq!(calls[0].command, "uptime");
    }
}
