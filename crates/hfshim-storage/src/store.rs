use crate::{KVStore, KeyEncoder, Result, StorageError, Transaction};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use hfshim_core::{GroupVersionKind, ObjectMeta, ResourceKey};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Object API over untyped JSON, shaped after the Kubernetes verbs
///
/// `update` never changes `.status`; `update_status` changes nothing else.
/// Both are version-checked when the incoming object carries a resourceVersion.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Value>;

    /// List objects of a kind; an empty namespace lists across all namespaces
    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Vec<Value>>;

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    async fn update_status(&self, key: &ResourceKey, object: Value) -> Result<Value>;

    /// Request deletion. Objects holding finalizers only get a deletionTimestamp.
    async fn delete(&self, key: &ResourceKey) -> Result<()>;
}

/// Embedded store over any [`KVStore`], with owner-reference garbage collection
pub struct KvResourceStore {
    kv: Arc<dyn KVStore>,
}

impl KvResourceStore {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn metadata_of(object: &Value) -> Result<ObjectMeta> {
    let meta = object.get("metadata").cloned().unwrap_or(Value::Null);
    if meta.is_null() {
        return Ok(ObjectMeta::default());
    }
    Ok(serde_json::from_value(meta)?)
}

fn resource_version_of(object: &Value) -> Option<&str> {
    object
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
}

fn metadata_mut(object: &mut Value) -> Result<&mut serde_json::Map<String, Value>> {
    let map = object
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid_object("object is not a JSON mapping"))?;
    let meta = map
        .entry("metadata")
        .or_insert_with(|| Value::Object(Default::default()));
    if meta.is_null() {
        *meta = Value::Object(Default::default());
    }
    meta.as_object_mut()
        .ok_or_else(|| StorageError::invalid_object("metadata is not a JSON mapping"))
}

fn set_meta(object: &mut Value, field: &str, value: Option<Value>) -> Result<()> {
    let meta = metadata_mut(object)?;
    match value {
        Some(v) => {
            meta.insert(field.to_string(), v);
        }
        None => {
            meta.remove(field);
        }
    }
    Ok(())
}

fn read_object(txn: &dyn Transaction, key: &ResourceKey) -> Result<Value> {
    let storage_key = KeyEncoder::encode_resource_key(key);
    let data = txn
        .get(storage_key.as_bytes())?
        .ok_or_else(|| StorageError::not_found(key.to_string()))?;
    Ok(serde_json::from_slice(&data)?)
}

fn write_object(txn: &mut dyn Transaction, storage_key: &str, object: &Value) -> Result<()> {
    let data = serde_json::to_vec(object)?;
    txn.put(storage_key.as_bytes(), &data)
}

fn next_revision(txn: &mut dyn Transaction) -> Result<String> {
    let current = match txn.get(KeyEncoder::REVISION_KEY)? {
        Some(raw) => String::from_utf8_lossy(&raw).parse::<u64>().unwrap_or(0),
        None => 0,
    };
    let next = (current + 1).to_string();
    txn.put(KeyEncoder::REVISION_KEY, next.as_bytes())?;
    Ok(next)
}

fn check_version(key: &ResourceKey, stored: &Value, incoming: &Value) -> Result<()> {
    if let Some(expected) = resource_version_of(incoming) {
        let actual = resource_version_of(stored).unwrap_or_default();
        if expected != actual {
            return Err(StorageError::conflict(key.to_string(), expected, actual));
        }
    }
    Ok(())
}

/// Remove an object, then collect every object owned by it.
///
/// Dependents with finalizers are marked for deletion instead of removed.
fn remove_cascading(txn: &mut dyn Transaction, storage_key: String, object: &Value) -> Result<()> {
    txn.delete(storage_key.as_bytes())?;
    let mut pending: Vec<String> = metadata_of(object)?.uid.into_iter().collect();

    while let Some(owner_uid) = pending.pop() {
        for (raw_key, data) in txn.scan(b"")? {
            if !KeyEncoder::is_object_key(&raw_key) {
                continue;
            }
            let mut dependent: Value = serde_json::from_slice(&data)?;
            let meta = metadata_of(&dependent)?;
            if !hfshim_core::is_owned_by(&meta, &owner_uid) {
                continue;
            }

            let dependent_key = String::from_utf8_lossy(&raw_key).to_string();
            if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
                if meta.deletion_timestamp.is_none() {
                    let revision = next_revision(txn)?;
                    set_meta(&mut dependent, "deletionTimestamp", Some(Value::String(now_rfc3339())))?;
                    set_meta(&mut dependent, "resourceVersion", Some(Value::String(revision)))?;
                    write_object(txn, &dependent_key, &dependent)?;
                }
                continue;
            }

            debug!("Garbage collecting {} (owner {})", dependent_key, owner_uid);
            txn.delete(raw_key.as_ref())?;
            if let Some(uid) = meta.uid {
                pending.push(uid);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl ResourceStore for KvResourceStore {
    async fn get(&self, key: &ResourceKey) -> Result<Value> {
        debug!("Getting resource: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        let data = self
            .kv
            .get(storage_key.as_bytes())?
            .ok_or_else(|| StorageError::not_found(key.to_string()))?;

        Ok(serde_json::from_slice(&data)?)
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Vec<Value>> {
        let namespace = Some(namespace).filter(|ns| !ns.is_empty());
        let prefix = KeyEncoder::encode_prefix(gvk, namespace);
        debug!("Listing resources with prefix: {}", prefix);

        let mut objects = Vec::new();
        for (_key, data) in self.kv.scan(prefix.as_bytes())? {
            objects.push(serde_json::from_slice(&data)?);
        }

        debug!("Found {} resources", objects.len());
        Ok(objects)
    }

    async fn create(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        info!("Creating resource: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;

        if txn.get(storage_key.as_bytes())?.is_some() {
            return Err(StorageError::already_exists(key.to_string()));
        }

        let revision = next_revision(txn.as_mut())?;
        if let Some(map) = object.as_object_mut() {
            map.insert("apiVersion".to_string(), Value::String(key.gvk.api_version()));
            map.insert("kind".to_string(), Value::String(key.gvk.kind.clone()));
        }
        set_meta(&mut object, "name", Some(Value::String(key.name.clone())))?;
        if key.is_namespaced() {
            set_meta(&mut object, "namespace", Some(Value::String(key.namespace.clone())))?;
        }
        set_meta(&mut object, "uid", Some(Value::String(Uuid::new_v4().to_string())))?;
        set_meta(&mut object, "resourceVersion", Some(Value::String(revision.clone())))?;
        set_meta(&mut object, "creationTimestamp", Some(Value::String(now_rfc3339())))?;
        set_meta(&mut object, "deletionTimestamp", None)?;

        write_object(txn.as_mut(), &storage_key, &object)?;
        txn.commit()?;

        info!("Created resource: {} with version {}", key, revision);
        Ok(object)
    }

    async fn update(&self, key: &ResourceKey, mut object: Value) -> Result<Value> {
        info!("Updating resource: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;
        let stored = read_object(txn.as_ref(), key)?;
        check_version(key, &stored, &object)?;

        // Status and server-owned metadata always come from the stored copy
        let map = object
            .as_object_mut()
            .ok_or_else(|| StorageError::invalid_object("object is not a JSON mapping"))?;
        match stored.get("status") {
            Some(status) => map.insert("status".to_string(), status.clone()),
            None => map.remove("status"),
        };
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            set_meta(&mut object, field, stored.pointer(&format!("/metadata/{}", field)).cloned())?;
        }

        let meta = metadata_of(&object)?;
        let drained = meta.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if meta.deletion_timestamp.is_some() && drained {
            info!("Finalizers drained, removing resource: {}", key);
            remove_cascading(txn.as_mut(), storage_key, &object)?;
            txn.commit()?;
            return Ok(object);
        }

        let revision = next_revision(txn.as_mut())?;
        set_meta(&mut object, "resourceVersion", Some(Value::String(revision.clone())))?;
        write_object(txn.as_mut(), &storage_key, &object)?;
        txn.commit()?;

        info!("Updated resource: {} with version {}", key, revision);
        Ok(object)
    }

    async fn update_status(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        info!("Updating status for resource: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;
        let mut stored = read_object(txn.as_ref(), key)?;
        check_version(key, &stored, &object)?;

        if let Some(status) = object.get("status") {
            stored["status"] = status.clone();
        }

        let revision = next_revision(txn.as_mut())?;
        set_meta(&mut stored, "resourceVersion", Some(Value::String(revision.clone())))?;
        write_object(txn.as_mut(), &storage_key, &stored)?;
        txn.commit()?;

        info!("Updated status for resource: {} with version {}", key, revision);
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        info!("Deleting resource: {}", key);

        let storage_key = KeyEncoder::encode_resource_key(key);
        let mut txn = self.kv.transaction()?;
        let mut stored = read_object(txn.as_ref(), key)?;
        let meta = metadata_of(&stored)?;

        if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if meta.deletion_timestamp.is_none() {
                let revision = next_revision(txn.as_mut())?;
                set_meta(&mut stored, "deletionTimestamp", Some(Value::String(now_rfc3339())))?;
                set_meta(&mut stored, "resourceVersion", Some(Value::String(revision)))?;
                write_object(txn.as_mut(), &storage_key, &stored)?;
                txn.commit()?;
            }
            info!("Resource {} marked for deletion, waiting on finalizers", key);
            return Ok(());
        }

        remove_cascading(txn.as_mut(), storage_key, &stored)?;
        txn.commit()?;

        info!("Deleted resource: {}", key);
        Ok(())
    }
}
