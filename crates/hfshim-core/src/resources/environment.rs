use crate::impl_resource;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Binding between the platform and one cloud provider account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: EnvironmentSpec,
}

impl_resource!(Environment, "hobbyfarm.io/v1", "Environment");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub provider: String,
    /// Provider settings such as `cred_secret`, `region` or `metro`
    #[serde(default)]
    pub environment_specifics: BTreeMap<String, String>,
    /// Per-template settings keyed by VirtualMachineTemplate name
    #[serde(default)]
    pub template_mapping: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ws_endpoint: String,
}

impl Environment {
    pub fn new(namespace: &str, name: &str, provider: &str) -> Self {
        Self {
            api_version: <Self as crate::Resource>::API_VERSION.to_string(),
            kind: <Self as crate::Resource>::KIND.to_string(),
            metadata: super::object_meta(namespace, name),
            spec: EnvironmentSpec {
                provider: provider.to_string(),
                ..Default::default()
            },
        }
    }

    /// Look up a provider setting; blank values count as absent
    pub fn specific(&self, key: &str) -> Option<&str> {
        self.spec
            .environment_specifics
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Look up a per-template setting; blank values count as absent
    pub fn template_setting(&self, template: &str, key: &str) -> Option<&str> {
        self.spec
            .template_mapping
            .get(template)
            .and_then(|settings| settings.get(key))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Boolean template flag, true only for the literal string "true"
    pub fn template_flag(&self, template: &str, key: &str) -> bool {
        self.template_setting(template, key) == Some("true")
    }

    pub fn with_specific(mut self, key: &str, value: &str) -> Self {
        self.spec
            .environment_specifics
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_template_setting(mut self, template: &str, key: &str, value: &str) -> Self {
        self.spec
            .template_mapping
            .entry(template.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Named VM template; its name indexes `EnvironmentSpec::template_mapping`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplate {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: VirtualMachineTemplateSpec,
}

impl_resource!(VirtualMachineTemplate, "hobbyfarm.io/v1", "VirtualMachineTemplate");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl VirtualMachineTemplate {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            api_version: <Self as crate::Resource>::API_VERSION.to_string(),
            kind: <Self as crate::Resource>::KIND.to_string(),
            metadata: super::object_meta(namespace, name),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specifics_lookup() {
        let env = Environment::new("hobbyfarm", "aws-east", "ec2")
            .with_specific("cred_secret", "aws-creds")
            .with_specific("region", " ")
            .with_template_setting("ubuntu", "image", "ami-123")
            .with_template_setting("ubuntu", "backup", "true")
            .with_template_setting("ubuntu", "ipv6", "yes");

        assert_eq!(env.specific("cred_secret"), Some("aws-creds"));
        assert_eq!(env.specific("region"), None);
        assert_eq!(env.specific("subnet"), None);
        assert_eq!(env.template_setting("ubuntu", "image"), Some("ami-123"));
        assert_eq!(env.template_setting("centos", "image"), None);
        assert!(env.template_flag("ubuntu", "backup"));
        assert!(!env.template_flag("ubuntu", "ipv6"));
    }
}
