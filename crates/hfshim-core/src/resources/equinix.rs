//! Child kinds consumed by the bare-metal provider controller (`equinix.hobbyfarm.io/v1alpha1`)

use crate::impl_resource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

/// Annotation the provider controller sets once an elastic IP is reserved
pub const ELASTIC_IP_ANNOTATION: &str = "elasticIP";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyPair {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ImportKeyPairSpec,
    #[serde(default)]
    pub status: ImportKeyPairStatus,
}

impl_resource!(ImportKeyPair, "equinix.hobbyfarm.io/v1alpha1", "ImportKeyPair");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyPairSpec {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyPairStatus {
    #[serde(default)]
    pub key_pair_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl_resource!(Instance, "equinix.hobbyfarm.io/v1alpha1", "Instance");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub metro: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub billing_cycle: String,
    #[serde(default)]
    pub ipxe_script_url: String,
    #[serde(default)]
    pub project_ssh_keys: Vec<String>,
    #[serde(default)]
    pub plan: String,
    /// Installer cloud-config, filled in once the elastic IP is known
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub facility: String,
}
