pub mod droplet;
pub mod ec2;
pub mod environment;
pub mod equinix;
pub mod virtual_machine;

pub use environment::{Environment, EnvironmentSpec, VirtualMachineTemplate, VirtualMachineTemplateSpec};
pub use virtual_machine::{
    Phase, ProviderKind, ProvisioningProgress, VirtualMachine, VirtualMachineSpec,
    VirtualMachineStatus, READY_LABEL,
};

use crate::{GroupVersionKind, ResourceKey, ResourceVersion};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

/// Base validation for all resources
pub fn validate_base(metadata: &ObjectMeta) -> Result<(), ResourceError> {
    if metadata.name.is_none() {
        return Err(ResourceError::MissingField("metadata.name".to_string()));
    }

    if let Some(name) = &metadata.name {
        if !is_valid_name(name) {
            return Err(ResourceError::InvalidName(name.clone()));
        }
    }

    Ok(())
}

/// Trait for resources kept in the resource store
pub trait Resource: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static {
    /// apiVersion of this resource type
    const API_VERSION: &'static str;

    /// Kind of this resource type
    const KIND: &'static str;

    /// Whether objects of this type live in a namespace
    const NAMESPACED: bool = true;

    /// Get the metadata of this resource
    fn metadata(&self) -> &ObjectMeta;

    /// Get mutable metadata
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    /// Get the GroupVersionKind
    fn gvk() -> GroupVersionKind {
        GroupVersionKind::from_api_version_kind(Self::API_VERSION, Self::KIND)
    }

    /// Build the key for an object of this type without loading it
    fn key_for(namespace: &str, name: &str) -> ResourceKey {
        if Self::NAMESPACED {
            ResourceKey::new(Self::gvk(), namespace, name)
        } else {
            ResourceKey::cluster_scoped(Self::gvk(), name)
        }
    }

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    /// Get the ResourceKey
    fn resource_key(&self) -> Result<ResourceKey, ResourceError> {
        let metadata = self.metadata();
        let name = metadata
            .name
            .as_ref()
            .ok_or_else(|| ResourceError::MissingField("metadata.name".to_string()))?;
        let namespace = metadata.namespace.clone().unwrap_or_default();

        Ok(Self::key_for(&namespace, name))
    }

    /// Get the resource version
    fn resource_version(&self) -> Option<ResourceVersion> {
        self.metadata()
            .resource_version
            .as_ref()
            .map(ResourceVersion::new)
    }

    /// Set the resource version
    fn set_resource_version(&mut self, version: ResourceVersion) {
        self.metadata_mut().resource_version = Some(version.0);
    }

    /// Get the UID
    fn uid(&self) -> Option<String> {
        self.metadata().uid.clone()
    }

    /// True once a delete has been requested but finalizers still hold the object
    fn is_being_deleted(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata()
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    fn set_label(&mut self, key: &str, value: &str) {
        self.metadata_mut()
            .labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata()
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    /// Validate the resource
    fn validate(&self) -> Result<(), ResourceError> {
        validate_base(self.metadata())
    }
}

/// Implements [`Resource`] for a struct carrying a `metadata: ObjectMeta` field.
///
/// ```ignore
/// impl_resource!(VirtualMachine, "hobbyfarm.io/v1", "VirtualMachine");
/// ```
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $api_version:literal, $kind:literal) => {
        impl $crate::Resource for $ty {
            const API_VERSION: &'static str = $api_version;
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &$crate::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(
                &mut self,
            ) -> &mut $crate::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

/// Construct metadata for a new namespaced object
pub fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Build a controller owner reference pointing at `owner`
pub fn controller_reference<R: Resource>(owner: &R) -> Result<OwnerReference, ResourceError> {
    let uid = owner
        .uid()
        .ok_or_else(|| ResourceError::MissingField("metadata.uid".to_string()))?;
    Ok(OwnerReference {
        api_version: R::API_VERSION.to_string(),
        kind: R::KIND.to_string(),
        name: owner.name().to_string(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Set `owner` as the controller of `child`.
///
/// Fails if the child is already controlled by a different object.
pub fn set_controller_reference<R: Resource>(
    child: &mut ObjectMeta,
    owner: &R,
) -> Result<(), ResourceError> {
    let reference = controller_reference(owner)?;
    let refs = child.owner_references.get_or_insert_with(Vec::new);

    if let Some(existing) = refs
        .iter()
        .find(|r| r.controller == Some(true) && r.uid != reference.uid)
    {
        return Err(ResourceError::ValidationFailed(format!(
            "object already controlled by {} {}",
            existing.kind, existing.name
        )));
    }

    refs.retain(|r| r.uid != reference.uid);
    refs.push(reference);
    Ok(())
}

/// True when `meta` lists an owner reference with the given uid
pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| refs.iter().any(|r| r.uid == owner_uid))
        .unwrap_or(false)
}

/// Resource-related errors
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

/// Validate a Kubernetes resource name (DNS-1123 subdomain)
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    // Must contain only lowercase alphanumeric, '-', or '.'
    // Must start and end with alphanumeric
    let chars: Vec<char> = name.chars().collect();

    if !chars[0].is_ascii_lowercase() && !chars[0].is_ascii_digit() {
        return false;
    }

    if !chars[chars.len() - 1].is_ascii_lowercase() && !chars[chars.len() - 1].is_ascii_digit() {
        return false;
    }

    chars
        .iter()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == '.')
}

// Built-in kinds the controller touches
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::Secret;

impl Resource for Secret {
    const API_VERSION: &'static str = "v1";
    const KIND: &'static str = "Secret";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Lease {
    const API_VERSION: &'static str = "coordination.k8s.io/v1";
    const KIND: &'static str = "Lease";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
