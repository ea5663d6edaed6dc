use serde::{Deserialize, Serialize};
use std::fmt;

/// GroupVersionKind uniquely identifies a resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    /// API group (e.g., "", "hobbyfarm.io", "ec2.hobbyfarm.io")
    pub group: String,
    /// API version (e.g., "v1", "v1alpha1")
    pub version: String,
    /// Resource kind (e.g., "VirtualMachine", "Secret")
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Create a GVK from apiVersion and kind
    /// apiVersion format: "v1" or "group/version"
    pub fn from_api_version_kind(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };

        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// Get the apiVersion string (group/version or just version)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Get the API path prefix ("api/v1" for the core group, "apis/{group}/{version}" otherwise)
    pub fn api_path(&self) -> String {
        if self.group.is_empty() {
            format!("api/{}", self.version)
        } else {
            format!("apis/{}/{}", self.group, self.version)
        }
    }

    /// Get the resource name (lowercase, plural)
    pub fn resource_name(&self) -> String {
        let lower = self.kind.to_lowercase();
        if lower.ends_with('s') {
            format!("{}es", lower)
        } else if let Some(stem) = lower.strip_suffix('y') {
            format!("{}ies", stem)
        } else {
            format!("{}s", lower)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// ResourceKey uniquely identifies a specific resource instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// GroupVersionKind of the resource
    pub gvk: GroupVersionKind,
    /// Namespace (empty for cluster-scoped resources)
    pub namespace: String,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    pub fn new(gvk: GroupVersionKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a cluster-scoped ResourceKey
    pub fn cluster_scoped(gvk: GroupVersionKind, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: String::new(),
            name: name.into(),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// Get the storage key encoding: {api_version}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {api_version}/{kind}/{name}
    pub fn storage_key(&self) -> String {
        let api_version = self.gvk.api_version();
        if self.is_namespaced() {
            format!("{}/{}/{}/{}", api_version, self.gvk.kind, self.namespace, self.name)
        } else {
            format!("{}/{}/{}", api_version, self.gvk.kind, self.name)
        }
    }

    /// Get the API path for this resource
    pub fn api_path(&self) -> String {
        format!("{}/{}", self.collection_path(), self.name)
    }

    /// Get the API path for the collection (without name)
    pub fn collection_path(&self) -> String {
        let base = self.gvk.api_path();
        let resource = self.gvk.resource_name();

        if self.is_namespaced() {
            format!("/{}/namespaces/{}/{}", base, self.namespace, resource)
        } else {
            format!("/{}/{}", base, resource)
        }
    }

    /// Short "namespace/name" form used in log fields
    pub fn object_ref(&self) -> String {
        if self.is_namespaced() {
            format!("{}/{}", self.namespace, self.name)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_namespaced() {
            write!(f, "{}/{}/{}", self.gvk, self.namespace, self.name)
        } else {
            write!(f, "{}/{}", self.gvk, self.name)
        }
    }
}

/// Opaque resource version used for optimistic concurrency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVersion(pub String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ResourceVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_from_api_version() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "Secret");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.api_version(), "v1");

        let gvk = GroupVersionKind::from_api_version_kind("hobbyfarm.io/v1", "VirtualMachine");
        assert_eq!(gvk.group, "hobbyfarm.io");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "VirtualMachine");
        assert_eq!(gvk.api_version(), "hobbyfarm.io/v1");
    }

    #[test]
    fn test_gvk_resource_name() {
        let gvk = GroupVersionKind::from_api_version_kind("hobbyfarm.io/v1", "VirtualMachine");
        assert_eq!(gvk.resource_name(), "virtualmachines");

        let gvk = GroupVersionKind::from_api_version_kind("ec2.hobbyfarm.io/v1alpha1", "ImportKeyPair");
        assert_eq!(gvk.resource_name(), "importkeypairs");
    }

    #[test]
    fn test_resource_key_storage_key() {
        let gvk = GroupVersionKind::from_api_version_kind("hobbyfarm.io/v1", "VirtualMachine");
        let key = ResourceKey::new(gvk, "hobbyfarm", "vm-1");
        assert_eq!(key.storage_key(), "hobbyfarm.io/v1/VirtualMachine/hobbyfarm/vm-1");

        let gvk = GroupVersionKind::from_api_version_kind("v1", "Namespace");
        let key = ResourceKey::cluster_scoped(gvk, "hobbyfarm");
        assert_eq!(key.storage_key(), "v1/Namespace/hobbyfarm");
    }

    #[test]
    fn test_resource_key_api_path() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "Secret");
        let key = ResourceKey::new(gvk, "hobbyfarm", "vm-1-ssh-keypair");
        assert_eq!(
            key.api_path(),
            "/api/v1/namespaces/hobbyfarm/secrets/vm-1-ssh-keypair"
        );

        let gvk = GroupVersionKind::from_api_version_kind("droplet.hobbyfarm.io/v1alpha1", "Instance");
        let key = ResourceKey::new(gvk, "hobbyfarm", "vm-1");
        assert_eq!(
            key.api_path(),
            "/apis/droplet.hobbyfarm.io/v1alpha1/namespaces/hobbyfarm/instances/vm-1"
        );
        assert_eq!(key.object_ref(), "hobbyfarm/vm-1");
    }
}
