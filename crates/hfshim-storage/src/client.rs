use crate::{ResourceStore, Result, StorageError};
use hfshim_core::{Resource, ResourceKey};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// What `create_or_update` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Created,
    Updated,
    Unchanged,
}

/// Typed view over a [`ResourceStore`]
#[derive(Clone)]
pub struct StoreClient {
    store: Arc<dyn ResourceStore>,
}

fn key_of<R: Resource>(object: &R) -> Result<ResourceKey> {
    Ok(object.resource_key()?)
}

fn encode<R: Resource>(object: &R) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| StorageError::invalid_object("resource did not serialize to a mapping"))?;
    map.insert("apiVersion".to_string(), Value::String(R::API_VERSION.to_string()));
    map.insert("kind".to_string(), Value::String(R::KIND.to_string()));
    Ok(value)
}

fn decode<R: Resource>(value: Value) -> Result<R> {
    Ok(serde_json::from_value(value)?)
}

impl StoreClient {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    pub async fn get<R: Resource>(&self, namespace: &str, name: &str) -> Result<R> {
        decode(self.store.get(&R::key_for(namespace, name)).await?)
    }

    /// Like [`get`](Self::get) but maps NotFound to `None`
    pub async fn get_opt<R: Resource>(&self, namespace: &str, name: &str) -> Result<Option<R>> {
        match self.get(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<R: Resource>(&self, namespace: &str) -> Result<Vec<R>> {
        self.store
            .list(&R::gvk(), namespace)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn create<R: Resource>(&self, object: &R) -> Result<R> {
        object.validate()?;
        let key = key_of(object)?;
        decode(self.store.create(&key, encode(object)?).await?)
    }

    pub async fn update<R: Resource>(&self, object: &R) -> Result<R> {
        let key = key_of(object)?;
        decode(self.store.update(&key, encode(object)?).await?)
    }

    pub async fn update_status<R: Resource>(&self, object: &R) -> Result<R> {
        let key = key_of(object)?;
        decode(self.store.update_status(&key, encode(object)?).await?)
    }

    pub async fn delete<R: Resource>(&self, namespace: &str, name: &str) -> Result<()> {
        self.store.delete(&R::key_for(namespace, name)).await
    }

    /// Fetch `object` by name, apply `mutate`, and write the result back.
    ///
    /// A missing object is created from `object` after mutation. An existing
    /// one is only written when the mutation changed it.
    pub async fn create_or_update<R, F>(&self, object: R, mut mutate: F) -> Result<(R, OperationResult)>
    where
        R: Resource,
        F: FnMut(&mut R) -> Result<()> + Send,
    {
        let key = key_of(&object)?;

        match self.get_opt::<R>(&key.namespace, &key.name).await? {
            None => {
                let mut fresh = object;
                mutate(&mut fresh)?;
                let created = self.create(&fresh).await?;
                debug!("create_or_update created {}", key);
                Ok((created, OperationResult::Created))
            }
            Some(existing) => {
                let mut desired = existing.clone();
                mutate(&mut desired)?;
                if encode(&desired)? == encode(&existing)? {
                    return Ok((existing, OperationResult::Unchanged));
                }
                let updated = self.update(&desired).await?;
                debug!("create_or_update updated {}", key);
                Ok((updated, OperationResult::Updated))
            }
        }
    }
}
