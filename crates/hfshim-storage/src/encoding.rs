use hfshim_core::{GroupVersionKind, ResourceKey};

/// Key encoder for storage keys
pub struct KeyEncoder;

impl KeyEncoder {
    /// Reserved key holding the store-wide revision counter
    pub const REVISION_KEY: &'static [u8] = b"\0meta/revision";

    /// Encode a resource key: {api_version}/{kind}/{namespace}/{name}
    /// For cluster-scoped: {api_version}/{kind}/{name}
    pub fn encode_resource_key(key: &ResourceKey) -> String {
        key.storage_key()
    }

    /// Encode a prefix for scanning resources of a kind, optionally within a namespace
    pub fn encode_prefix(gvk: &GroupVersionKind, namespace: Option<&str>) -> String {
        let api_version = gvk.api_version();
        match namespace {
            Some(ns) => format!("{}/{}/{}/", api_version, gvk.kind, ns),
            None => format!("{}/{}/", api_version, gvk.kind),
        }
    }

    /// True for keys that hold objects rather than store bookkeeping
    pub fn is_object_key(key: &[u8]) -> bool {
        !key.starts_with(b"\0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_resource_key() {
        let gvk = GroupVersionKind::from_api_version_kind("v1", "Secret");
        let key = ResourceKey::new(gvk, "hobbyfarm", "vm-1-ssh-keypair");
        assert_eq!(
            KeyEncoder::encode_resource_key(&key),
            "v1/Secret/hobbyfarm/vm-1-ssh-keypair"
        );
    }

    #[test]
    fn test_encode_prefix() {
        let gvk = GroupVersionKind::from_api_version_kind("hobbyfarm.io/v1", "VirtualMachine");
        assert_eq!(
            KeyEncoder::encode_prefix(&gvk, Some("hobbyfarm")),
            "hobbyfarm.io/v1/VirtualMachine/hobbyfarm/"
        );
        assert_eq!(
            KeyEncoder::encode_prefix(&gvk, None),
            "hobbyfarm.io/v1/VirtualMachine/"
        );
        assert!(!KeyEncoder::is_object_key(KeyEncoder::REVISION_KEY));
        assert!(KeyEncoder::is_object_key(b"v1/Secret/hobbyfarm/a"));
    }
}
