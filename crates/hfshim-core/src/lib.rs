//! hfshim Core - Resource model for the hfshim VM provisioning controller
//!
//! This crate provides:
//! - The platform kinds (VirtualMachine, Environment, VirtualMachineTemplate)
//! - Per-provider child kinds (ImportKeyPair, Instance)
//! - Error types with miette diagnostics
//! - Type-safe resource keys and owner references
//! - Serialization helpers

pub mod error;
pub mod resources;
pub mod types;

// Re-export commonly used types
pub use error::{Result, ShimError};
pub use resources::{
    controller_reference, droplet, ec2, equinix, is_owned_by, is_valid_name, object_meta,
    set_controller_reference, Environment, EnvironmentSpec, Phase, ProviderKind,
    ProvisioningProgress, Resource, ResourceError, VirtualMachine, VirtualMachineSpec,
    VirtualMachineStatus, VirtualMachineTemplate, READY_LABEL,
};
pub use types::{GroupVersionKind, ResourceKey, ResourceVersion};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::coordination::v1::Lease;
pub use k8s_openapi::api::core::v1::Secret;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Serialize a resource to JSON
pub fn to_json<T: serde::Serialize>(resource: &T) -> Result<String> {
    serde_json::to_string(resource).map_err(|e| {
        ShimError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a resource from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        ShimError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Convert a resource into a JSON value
pub fn to_value<T: serde::Serialize>(resource: &T) -> Result<serde_json::Value> {
    serde_json::to_value(resource).map_err(|e| {
        ShimError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Convert a JSON value into a typed resource
pub fn from_value<T: for<'de> serde::Deserialize<'de>>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        ShimError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_serialization() {
        let vm = VirtualMachine::new("hobbyfarm", "vm-1");

        let json = to_json(&vm).unwrap();
        assert!(json.contains("vm-1"));
        assert!(json.contains("\"apiVersion\":\"hobbyfarm.io/v1\""));

        let deserialized: VirtualMachine = from_json(&json).unwrap();
        assert_eq!(deserialized.metadata.name, Some("vm-1".to_string()));
    }

    #[test]
    fn test_value_conversion_rejects_wrong_shape() {
        let value = serde_json::json!({"metadata": {"name": 42}});
        let result: Result<VirtualMachine> = from_value(value);
        assert!(matches!(result, Err(ShimError::SerializationError { .. })));
    }
}
