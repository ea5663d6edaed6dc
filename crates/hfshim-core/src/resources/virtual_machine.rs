use crate::error::{Result, ShimError};
use crate::impl_resource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label the platform reads to decide whether sessions may be routed to a VM
pub const READY_LABEL: &str = "ready";

/// A request for one provisioned, shell-reachable compute instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl_resource!(VirtualMachine, "hobbyfarm.io/v1", "VirtualMachine");

impl VirtualMachine {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            api_version: <Self as crate::Resource>::API_VERSION.to_string(),
            kind: <Self as crate::Resource>::KIND.to_string(),
            metadata: super::object_meta(namespace, name),
            ..Default::default()
        }
    }

    /// Name of the request field that prevents this VM from ever provisioning, if any
    pub fn missing_request_field(&self) -> Option<&'static str> {
        if self.spec.vm_template_id.is_empty() {
            Some("spec.vmTemplateId")
        } else if self.spec.environment_id.is_empty() {
            Some("spec.environmentId")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    #[serde(default)]
    pub vm_template_id: String,
    #[serde(default)]
    pub environment_id: String,
    /// Overrides the provider's default login user for liveness checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_username: Option<String>,
    /// Name of the credential Secret holding the generated key pair
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_pair: String,
    /// Set by the platform once the owning session has ended.
    /// hobbyfarm's own schema carries this flag under `status.tainted`.
    #[serde(default)]
    pub tainted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
    /// Last diagnostic from a failed pass, cleared on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub provisioning: ProvisioningProgress,
}

/// Progress recorded across passes so no side effect repeats once durable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningProgress {
    #[serde(default)]
    pub secret_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_key_pair: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_url: Option<String>,
}

/// Provisioning phase, serialized the way the platform writes it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    ReadyForProvisioning,
    SecretCreated,
    ImportKeyPairCreated,
    Provisioned,
    Running,
    Error,
    /// Any value this controller does not own
    #[serde(other)]
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::ReadyForProvisioning => "readyforprovisioning",
            Phase::SecretCreated => "secretcreated",
            Phase::ImportKeyPairCreated => "importkeypaircreated",
            Phase::Provisioned => "provisioned",
            Phase::Running => "running",
            Phase::Error => "error",
            Phase::Unknown => "unknown",
        }
    }

    /// Phases after which nothing more is done for the VM
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Running | Phase::Error)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloud backend an Environment binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ec2,
    Droplet,
    Equinix,
}

impl ProviderKind {
    /// Resolve an Environment provider tag, accepting the vendor aliases
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "ec2" | "aws" => Ok(ProviderKind::Ec2),
            "droplet" | "digitalocean" => Ok(ProviderKind::Droplet),
            "equinix" | "metal" => Ok(ProviderKind::Equinix),
            _ => Err(ShimError::unknown_provider(tag)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ec2 => "ec2",
            ProviderKind::Droplet => "droplet",
            ProviderKind::Equinix => "equinix",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_wire_format() {
        let json = serde_json::to_string(&Phase::ImportKeyPairCreated).unwrap();
        assert_eq!(json, "\"importkeypaircreated\"");

        let phase: Phase = serde_json::from_str("\"readyforprovisioning\"").unwrap();
        assert_eq!(phase, Phase::ReadyForProvisioning);

        let phase: Phase = serde_json::from_str("\"terminating\"").unwrap();
        assert_eq!(phase, Phase::Unknown);
    }

    #[test]
    fn test_provider_aliases() {
        assert_eq!(ProviderKind::from_tag("aws").unwrap(), ProviderKind::Ec2);
        assert_eq!(ProviderKind::from_tag("DigitalOcean").unwrap(), ProviderKind::Droplet);
        assert_eq!(ProviderKind::from_tag("metal").unwrap(), ProviderKind::Equinix);
        assert!(matches!(
            ProviderKind::from_tag("vsphere"),
            Err(ShimError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn test_deserialize_platform_object() {
        let vm: VirtualMachine = serde_json::from_value(serde_json::json!({
            "apiVersion": "hobbyfarm.io/v1",
            "kind": "VirtualMachine",
            "metadata": {"name": "vm-1", "namespace": "hobbyfarm", "labels": {"ready": "false"}},
            "spec": {"vmTemplateId": "ubuntu", "environmentId": "aws-east"},
            "status": {"phase": "readyforprovisioning"}
        }))
        .unwrap();

        assert_eq!(vm.spec.vm_template_id, "ubuntu");
        assert!(!vm.spec.tainted);
        assert_eq!(vm.status.phase, Phase::ReadyForProvisioning);
        assert!(!vm.status.provisioning.secret_created);
        assert_eq!(vm.missing_request_field(), None);
    }

    #[test]
    fn test_missing_request_field() {
        let mut vm = VirtualMachine::new("hobbyfarm", "vm-1");
        assert_eq!(vm.missing_request_field(), Some("spec.vmTemplateId"));
        vm.spec.vm_template_id = "ubuntu".to_string();
        assert_eq!(vm.missing_request_field(), Some("spec.environmentId"));
    }
}
