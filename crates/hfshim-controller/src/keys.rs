use crate::error::{ControllerError, Result};
use hfshim_core::k8s_openapi::ByteString;
use hfshim_core::{set_controller_reference, Resource, Secret, VirtualMachine};
use hfshim_storage::{OperationResult, StoreClient};
use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tracing::{debug, info};

pub const PUBLIC_KEY_FIELD: &str = "public_key";
pub const PRIVATE_KEY_FIELD: &str = "private_key";

/// Freshly generated OpenSSH key pair
#[derive(Clone)]
pub struct KeyPair {
    /// `ssh-ed25519 AAAA...` line
    pub public_key: String,
    pub private_key: String,
}

pub fn generate_key_pair() -> Result<KeyPair> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| ControllerError::key_error(format!("failed to generate key: {}", e)))?;
    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| ControllerError::key_error(format!("failed to encode private key: {}", e)))?;
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| ControllerError::key_error(format!("failed to encode public key: {}", e)))?;

    Ok(KeyPair {
        public_key,
        private_key: private_key.to_string(),
    })
}

/// Name of the credential Secret for a VirtualMachine
pub fn secret_name(vm_name: &str) -> String {
    format!("{}-ssh-keypair", vm_name)
}

fn field(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|bytes| String::from_utf8(bytes.0.clone()).ok())
        .filter(|value| !value.trim().is_empty())
}

/// Make sure the VM's credential Secret exists and return its public key.
///
/// An existing Secret with both halves of a key pair is reused as is, so a
/// replayed pass never rotates the key. Once the VM records the Secret as
/// created, a missing Secret is an error instead of a reason to generate a
/// new key.
pub async fn ensure_credential_secret(client: &StoreClient, vm: &VirtualMachine) -> Result<String> {
    let name = secret_name(vm.name());

    if vm.status.provisioning.secret_created {
        let secret = client
            .get_opt::<Secret>(vm.namespace(), &name)
            .await?
            .ok_or_else(|| ControllerError::missing_reference("Secret", &name))?;
        return field(&secret, PUBLIC_KEY_FIELD).ok_or_else(|| {
            ControllerError::key_error(format!("secret '{}' has no {}", name, PUBLIC_KEY_FIELD))
        });
    }

    if let Some(existing) = client.get_opt::<Secret>(vm.namespace(), &name).await? {
        if let (Some(public_key), Some(_)) = (
            field(&existing, PUBLIC_KEY_FIELD),
            field(&existing, PRIVATE_KEY_FIELD),
        ) {
            debug!("Reusing credential secret {}/{}", vm.namespace(), name);
            return Ok(public_key);
        }
    }

    let pair = generate_key_pair()?;
    let secret = Secret {
        metadata: hfshim_core::object_meta(vm.namespace(), &name),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let (_, result) = client
        .create_or_update(secret, |s: &mut Secret| {
            set_controller_reference(&mut s.metadata, vm)?;
            let data = s.data.get_or_insert_with(Default::default);
            data.insert(
                PUBLIC_KEY_FIELD.to_string(),
                ByteString(pair.public_key.clone().into_bytes()),
            );
            data.insert(
                PRIVATE_KEY_FIELD.to_string(),
                ByteString(pair.private_key.clone().into_bytes()),
            );
            Ok(())
        })
        .await?;

    if result != OperationResult::Unchanged {
        info!("Wrote credential secret {}/{}", vm.namespace(), name);
    }
    Ok(pair.public_key)
}

async fn credential_field(client: &StoreClient, vm: &VirtualMachine, key: &str) -> Result<String> {
    let name = if vm.spec.key_pair.is_empty() {
        secret_name(vm.name())
    } else {
        vm.spec.key_pair.clone()
    };

    let secret = client
        .get_opt::<Secret>(vm.namespace(), &name)
        .await?
        .ok_or_else(|| ControllerError::missing_reference("Secret", &name))?;

    field(&secret, key)
        .ok_or_else(|| ControllerError::key_error(format!("secret '{}' has no {}", name, key)))
}

/// Read the private key a VM's instances were provisioned with
pub async fn private_key(client: &StoreClient, vm: &VirtualMachine) -> Result<String> {
    credential_field(client, vm, PRIVATE_KEY_FIELD).await
}

pub async fn public_key(client: &StoreClient, vm: &VirtualMachine) -> Result<String> {
    credential_field(client, vm, PUBLIC_KEY_FIELD).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfshim_storage::{KvResourceStore, RedbBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn make_client() -> (StoreClient, TempDir) {
        let dir = TempDir::new().unwrap();
        let backend = RedbBackend::new(dir.path().join("keys.redb")).unwrap();
        let store = KvResourceStore::new(Arc::new(backend));
        (StoreClient::new(Arc::new(store)), dir)
    }

    #[test]
    fn test_generate_key_pair() {
        let pair = generate_key_pair().unwrap();
        assert!(pair.public_key.starts_with("ssh-ed25519 "));
        assert!(pair.private_key.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert!(PrivateKey::from_openssh(&pair.private_key).is_ok());
    }

    #[tokio::test]
    async fn test_secret_is_created_once() {
        let (client, _dir) = make_client();
        let vm = client.create(&VirtualMachine::new("hobbyfarm", "vm-1")).await.unwrap();

        let first = ensure_credential_secret(&client, &vm).await.unwrap();
        let second = ensure_credential_secret(&client, &vm).await.unwrap();
        assert_eq!(first, second);

        let secret: Secret = client.get("hobbyfarm", "vm-1-ssh-keypair").await.unwrap();
        assert!(hfshim_core::is_owned_by(&secret.metadata, &vm.uid().unwrap()));
        assert_eq!(client.list::<Secret>("hobbyfarm").await.unwrap().len(), 1);

        let key = private_key(&client, &vm).await.unwrap();
        assert!(key.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert_eq!(public_key(&client, &vm).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_recorded_secret_is_not_regenerated() {
        let (client, _dir) = make_client();
        let mut vm = client.create(&VirtualMachine::new("hobbyfarm", "vm-1")).await.unwrap();
        let first = ensure_credential_secret(&client, &vm).await.unwrap();
        vm.status.provisioning.secret_created = true;

        assert_eq!(ensure_credential_secret(&client, &vm).await.unwrap(), first);

        client.delete::<Secret>("hobbyfarm", "vm-1-ssh-keypair").await.unwrap();
        let err = ensure_credential_secret(&client, &vm).await.unwrap_err();
        assert!(matches!(err, ControllerError::MissingReference { .. }));
        assert!(client.list::<Secret>("hobbyfarm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_private_key_requires_secret() {
        let (client, _dir) = make_client();
        let mut vm = VirtualMachine::new("hobbyfarm", "vm-1");
        vm.spec.key_pair = "elsewhere".to_string();
        let err = private_key(&client, &vm).await.unwrap_err();
        assert!(matches!(err, ControllerError::MissingReference { .. }));
    }
}
