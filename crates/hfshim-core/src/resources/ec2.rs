//! Child kinds consumed by the ec2 provider controller (`ec2.hobbyfarm.io/v1alpha1`)

use crate::impl_resource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

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

impl_resource!(ImportKeyPair, "ec2.hobbyfarm.io/v1alpha1", "ImportKeyPair");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyPairSpec {
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub key_name: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportKeyPairStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub key_pair_id: String,
    #[serde(default)]
    pub fingerprint: String,
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

impl_resource!(Instance, "ec2.hobbyfarm.io/v1alpha1", "Instance");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub subnet_id: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub region: String,
    /// Base64-encoded cloud-config
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub public_ip_address: bool,
    #[serde(default)]
    pub key_name: String,
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
}
