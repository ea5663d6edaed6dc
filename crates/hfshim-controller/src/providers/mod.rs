//! Cloud backends a VirtualMachine can be provisioned on
//!
//! Each backend is driven through provider-specific child resources
//! (an ImportKeyPair and an Instance) that a separate provider controller
//! turns into real cloud objects. The adapters here only write the child
//! specs and read back the child statuses.

pub mod droplet;
pub mod ec2;
pub mod metal;

use crate::error::{ControllerError, Result};
use crate::keys;
use crate::liveness::{LivenessProber, ProbeTarget};
use hfshim_core::{Environment, ProviderKind, Resource, VirtualMachine, VirtualMachineTemplate};
use hfshim_storage::StoreClient;
use std::fmt;
use tracing::debug;

/// Everything an adapter needs for one pass over one VirtualMachine
pub struct ProvisionContext<'a> {
    pub client: &'a StoreClient,
    pub prober: &'a dyn LivenessProber,
    pub vm: &'a mut VirtualMachine,
    pub environment: &'a Environment,
    pub template: &'a VirtualMachineTemplate,
}

impl ProvisionContext<'_> {
    /// Required setting from `environmentSpecifics`
    pub fn setting(&self, provider: Provider, key: &str) -> Result<String> {
        self.environment
            .specific(key)
            .map(str::to_string)
            .ok_or_else(|| {
                ControllerError::missing_setting(provider.kind().as_str(), self.environment.name(), key)
            })
    }

    pub fn setting_or(&self, key: &str, default: &str) -> String {
        self.environment.specific(key).unwrap_or(default).to_string()
    }

    pub fn template_name(&self) -> &str {
        self.template.name()
    }

    pub fn template_setting(&self, key: &str) -> Option<String> {
        self.environment
            .template_setting(self.template_name(), key)
            .map(str::to_string)
    }

    pub fn required_template_setting(&self, key: &str) -> Result<String> {
        self.template_setting(key).ok_or_else(|| {
            ControllerError::missing_template_setting(
                self.environment.name(),
                self.template_name(),
                key,
            )
        })
    }

    pub fn template_flag(&self, key: &str) -> bool {
        self.environment.template_flag(self.template_name(), key)
    }

    /// Name of the ImportKeyPair recorded by `import_key_pair`
    pub fn imported_key_pair(&self) -> String {
        self.vm
            .status
            .provisioning
            .imported_key_pair
            .clone()
            .unwrap_or_else(|| self.vm.name().to_string())
    }
}

/// Provider-neutral reading of an Instance child's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Still being created
    Pending,
    /// Booted; the remote shell should answer
    Active,
    /// Waiting for the core to hand over a bootstrap document
    AwaitingBootstrap,
    /// A status this controller does not recognise
    Unknown,
}

/// Network details read from an Instance child
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFacts {
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub hostname: Option<String>,
    /// Provider instance identifier
    pub instance_id: Option<String>,
    /// Data-center facility, bare metal only
    pub facility: Option<String>,
}

impl InstanceFacts {
    /// Copy whatever is known onto the VM status, keeping earlier values otherwise
    pub fn apply(&self, vm: &mut VirtualMachine) {
        let status = &mut vm.status;
        if self.public_ip.is_some() {
            status.public_ip.clone_from(&self.public_ip);
        }
        if self.private_ip.is_some() {
            status.private_ip.clone_from(&self.private_ip);
        }
        if self.hostname.is_some() {
            status.hostname.clone_from(&self.hostname);
        }
    }
}

/// Result of `fetch_instance`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedInstance {
    pub state: InstanceState,
    pub facts: InstanceFacts,
    /// Liveness result; only probed when the instance is active
    pub reachable: bool,
}

pub(crate) fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Closed set of provisioning backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Ec2,
    Droplet,
    Metal,
}

impl Provider {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Ec2 => Provider::Ec2,
            ProviderKind::Droplet => Provider::Droplet,
            ProviderKind::Equinix => Provider::Metal,
        }
    }

    /// Select the backend an Environment is bound to
    pub fn resolve(environment: &Environment) -> Result<Self> {
        Ok(Self::for_kind(ProviderKind::from_tag(&environment.spec.provider)?))
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Ec2 => ProviderKind::Ec2,
            Provider::Droplet => ProviderKind::Droplet,
            Provider::Metal => ProviderKind::Equinix,
        }
    }

    /// Login user when neither the VM nor the Environment names one
    pub fn default_username(&self, facts: &InstanceFacts) -> String {
        match self {
            Provider::Ec2 => "ubuntu".to_string(),
            Provider::Droplet => "root".to_string(),
            Provider::Metal => facts.instance_id.clone().unwrap_or_default(),
        }
    }

    /// Command run to decide the instance is usable
    pub fn probe_command(&self) -> &'static str {
        match self {
            Provider::Ec2 | Provider::Droplet => "uptime",
            Provider::Metal => "help",
        }
    }

    /// Host the remote shell is reached on
    pub fn ssh_host(&self, facts: &InstanceFacts) -> Option<String> {
        match (self, &facts.facility) {
            (Provider::Metal, Some(facility)) => Some(metal::console_host(facility)),
            _ => facts.public_ip.clone().or_else(|| facts.private_ip.clone()),
        }
    }

    /// Register the VM's public key with the provider
    pub async fn import_key_pair(&self, ctx: &mut ProvisionContext<'_>, public_key: &str) -> Result<()> {
        let name = match self {
            Provider::Ec2 => ec2::import_key_pair(ctx, public_key).await?,
            Provider::Droplet => droplet::import_key_pair(ctx, public_key).await?,
            Provider::Metal => metal::import_key_pair(ctx, public_key).await?,
        };
        ctx.vm.status.provisioning.provider = Some(self.kind());
        ctx.vm.status.provisioning.imported_key_pair = Some(name);
        Ok(())
    }

    /// Request the instance itself
    pub async fn launch_instance(&self, ctx: &mut ProvisionContext<'_>) -> Result<()> {
        match self {
            Provider::Ec2 => ec2::launch_instance(ctx).await,
            Provider::Droplet => droplet::launch_instance(ctx).await,
            Provider::Metal => metal::launch_instance(ctx).await,
        }
    }

    /// Read the Instance child, copy its facts onto the VM and probe it once active
    pub async fn fetch_instance(&self, ctx: &mut ProvisionContext<'_>) -> Result<FetchedInstance> {
        let (state, facts) = match self {
            Provider::Ec2 => ec2::fetch_instance(ctx).await?,
            Provider::Droplet => droplet::fetch_instance(ctx).await?,
            Provider::Metal => metal::fetch_instance(ctx).await?,
        };
        facts.apply(ctx.vm);

        let reachable = match state {
            InstanceState::Active => self.liveness_check(ctx, &facts).await?,
            _ => false,
        };

        Ok(FetchedInstance {
            state,
            facts,
            reachable,
        })
    }

    /// Log in to the instance and run the probe command
    pub async fn liveness_check(&self, ctx: &mut ProvisionContext<'_>, facts: &InstanceFacts) -> Result<bool> {
        let Some(host) = self.ssh_host(facts) else {
            debug!("Instance {} has no address yet", ctx.vm.name());
            return Ok(false);
        };

        let username = resolve_username(*self, ctx, facts);
        if *self == Provider::Metal && ctx.vm.spec.ssh_username.as_deref().unwrap_or("").is_empty() {
            ctx.vm.spec.ssh_username = Some(username.clone());
        }
        ctx.vm.status.provisioning.ssh_endpoint = Some(host.clone());

        let private_key = keys::private_key(ctx.client, ctx.vm).await?;
        let target = ProbeTarget::new(&host, &username, &private_key, self.probe_command());
        ctx.prober.probe(&target).await
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

/// VM override, then Environment `ssh_username`, then the provider default
fn resolve_username(provider: Provider, ctx: &ProvisionContext<'_>, facts: &InstanceFacts) -> String {
    ctx.vm
        .spec
        .ssh_username
        .as_deref()
        .and_then(non_empty)
        .or_else(|| ctx.environment.specific("ssh_username").map(str::to_string))
        .unwrap_or_else(|| provider.default_username(facts))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::mock::MockProber;
    use hfshim_storage::{KvResourceStore, RedbBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    pub const NAMESPACE: &str = "hobbyfarm";
    pub const TEMPLATE: &str = "ubuntu";

    pub struct Fixture {
        pub client: StoreClient,
        pub prober: MockProber,
        pub vm: VirtualMachine,
        pub environment: Environment,
        pub template: VirtualMachineTemplate,
        _dir: TempDir,
    }

    impl Fixture {
        /// A stored VM with its credential Secret, bound to `environment`
        pub async fn new(environment: Environment) -> Self {
            let dir = TempDir::new().unwrap();
            let backend = RedbBackend::new(dir.path().join("providers.redb")).unwrap();
            let client = StoreClient::new(Arc::new(KvResourceStore::new(Arc::new(backend))));

            let mut vm = VirtualMachine::new(NAMESPACE, "vm-1");
            vm.spec.vm_template_id = TEMPLATE.to_string();
            vm.spec.environment_id = environment.name().to_string();
            let mut vm = client.create(&vm).await.unwrap();
            keys::ensure_credential_secret(&client, &vm).await.unwrap();
            vm.spec.key_pair = keys::secret_name(vm.name());

            Self {
                client,
                prober: MockProber::healthy(),
                vm,
                environment,
                template: VirtualMachineTemplate::new(NAMESPACE, TEMPLATE),
                _dir: dir,
            }
        }

        pub fn ctx(&mut self) -> ProvisionContext<'_> {
            ProvisionContext {
                client: &self.client,
                prober: &self.prober,
                vm: &mut self.vm,
                environment: &self.environment,
                template: &self.template,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_resolve_provider() {
        let env = Environment::new(NAMESPACE, "do", "digitalocean");
        assert_eq!(Provider::resolve(&env).unwrap(), Provider::Droplet);

        let env = Environment::new(NAMESPACE, "odd", "vsphere");
        let err = Provider::resolve(&env).unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Configuration);
    }

    #[test]
    fn test_ssh_host_selection() {
        let facts = InstanceFacts {
            private_ip: Some("10.0.0.4".to_string()),
            ..Default::default()
        };
        assert_eq!(Provider::Ec2.ssh_host(&facts).as_deref(), Some("10.0.0.4"));

        let facts = InstanceFacts {
            public_ip: Some("203.0.113.5".to_string()),
            private_ip: Some("10.0.0.4".to_string()),
            facility: Some("da11".to_string()),
            ..Default::default()
        };
        assert_eq!(Provider::Droplet.ssh_host(&facts).as_deref(), Some("203.0.113.5"));
        assert_eq!(
            Provider::Metal.ssh_host(&facts).as_deref(),
            Some("sos.da11.platformequinix.com")
        );
    }

    #[tokio::test]
    async fn test_username_precedence() {
        let env = Environment::new(NAMESPACE, "aws", "ec2");
        let mut fixture = Fixture::new(env).await;
        let facts = InstanceFacts::default();

        assert_eq!(resolve_username(Provider::Ec2, &fixture.ctx(), &facts), "ubuntu");

        fixture.environment = fixture.environment.clone().with_specific("ssh_username", "admin");
        assert_eq!(resolve_username(Provider::Ec2, &fixture.ctx(), &facts), "admin");

        fixture.vm.spec.ssh_username = Some("student".to_string());
        assert_eq!(resolve_username(Provider::Ec2, &fixture.ctx(), &facts), "student");
    }

    #[tokio::test]
    async fn test_liveness_without_address_is_not_ready() {
        let env = Environment::new(NAMESPACE, "aws", "ec2");
        let mut fixture = Fixture::new(env).await;
        let reachable = Provider::Ec2
            .liveness_check(&mut fixture.ctx(), &InstanceFacts::default())
            .await
            .unwrap();
        assert!(!reachable);
        assert!(fixture.prober.calls().await.is_empty());
    }
}
