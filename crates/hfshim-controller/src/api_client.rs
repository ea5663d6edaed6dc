use async_trait::async_trait;
use hfshim_core::{GroupVersionKind, ResourceKey};
use hfshim_storage::{ResourceStore, Result, StorageError};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

/// [`ResourceStore`] backed by a Kubernetes-compatible API server
pub struct HttpResourceStore {
    base_url: String,
    client: Client,
    token: Option<String>,
}

impl HttpResourceStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        debug!("{} {}", method, url);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        builder
            .send()
            .await
            .map_err(|e| StorageError::io_error(format!("HTTP request failed: {}", e), Some(Box::new(e))))
    }

    async fn write(&self, method: Method, path: &str, key: &ResourceKey, object: Value) -> Result<Value> {
        let creating = method == Method::POST;
        let expected = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let url = self.url(path);
        let resp = self.send(self.request(method, &url).json(&object)).await?;
        let resp = check_status(resp, key, |status| {
            if status == StatusCode::CONFLICT {
                Some(if creating {
                    StorageError::already_exists(key.to_string())
                } else {
                    StorageError::conflict(key.to_string(), expected.clone(), "unknown")
                })
            } else {
                None
            }
        })
        .await?;
        json_body(resp).await
    }
}

/// Map a non-success response to a StorageError
async fn check_status<F>(resp: Response, key: &ResourceKey, special: F) -> Result<Response>
where
    F: FnOnce(StatusCode) -> Option<StorageError>,
{
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(StorageError::not_found(key.to_string()));
    }
    if let Some(err) = special(status) {
        return Err(err);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(StorageError::database_error(
        format!("API server returned {} for {}: {}", status, key, body),
        None,
    ))
}

async fn json_body(resp: Response) -> Result<Value> {
    resp.json::<Value>().await.map_err(|e| {
        StorageError::serialization_error(format!("Failed to parse response body: {}", e), Some(Box::new(e)))
    })
}

/// List items come back without apiVersion and kind; fill them in
fn list_items(body: Value, gvk: &GroupVersionKind) -> Vec<Value> {
    let items = match body {
        Value::Object(mut map) => map.remove("items"),
        _ => None,
    };
    let Some(Value::Array(items)) = items else {
        return Vec::new();
    };

    items
        .into_iter()
        .map(|mut item| {
            if let Some(map) = item.as_object_mut() {
                map.entry("apiVersion")
                    .or_insert_with(|| Value::String(gvk.api_version()));
                map.entry("kind").or_insert_with(|| Value::String(gvk.kind.clone()));
            }
            item
        })
        .collect()
}

#[async_trait]
impl ResourceStore for HttpResourceStore {
    async fn get(&self, key: &ResourceKey) -> Result<Value> {
        let url = self.url(&key.api_path());
        let resp = self.send(self.request(Method::GET, &url)).await?;
        let resp = check_status(resp, key, |_| None).await?;
        json_body(resp).await
    }

    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Vec<Value>> {
        let collection = ResourceKey::new(gvk.clone(), namespace, "");
        let url = self.url(&collection.collection_path());
        let resp = self.send(self.request(Method::GET, &url)).await?;
        let resp = check_status(resp, &collection, |_| None).await?;
        Ok(list_items(json_body(resp).await?, gvk))
    }

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        self.write(Method::POST, &key.collection_path(), key, object).await
    }

    async fn update(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        self.write(Method::PUT, &key.api_path(), key, object).await
    }

    async fn update_status(&self, key: &ResourceKey, object: Value) -> Result<Value> {
        let path = format!("{}/status", key.api_path());
        self.write(Method::PUT, &path, key, object).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let url = self.url(&key.api_path());
        let resp = self.send(self.request(Method::DELETE, &url)).await?;
        check_status(resp, key, |_| None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use serde_json::json;
    use tokio::net::TcpListener;

    fn vm_gvk() -> GroupVersionKind {
        GroupVersionKind::new("hobbyfarm.io", "v1", "VirtualMachine")
    }

    async fn fake_api_server() -> String {
        let app = Router::new()
            .route(
                "/apis/hobbyfarm.io/v1/namespaces/{ns}/virtualmachines",
                get(|| async {
                    Json(json!({
                        "kind": "VirtualMachineList",
                        "items": [{"metadata": {"name": "vm-1", "namespace": "hobbyfarm"}}]
                    }))
                })
                .post(|| async { (AxumStatus::CONFLICT, "exists") }),
            )
            .route(
                "/apis/hobbyfarm.io/v1/namespaces/{ns}/virtualmachines/{name}",
                get(|Path((_ns, name)): Path<(String, String)>| async move {
                    if name == "vm-1" {
                        Ok(Json(json!({"metadata": {"name": name}})))
                    } else {
                        Err(AxumStatus::NOT_FOUND)
                    }
                })
                .put(|| async { (AxumStatus::CONFLICT, "stale") }),
            )
            .route(
                "/apis/hobbyfarm.io/v1/namespaces/{ns}/virtualmachines/{name}/status",
                put(|Json(body): Json<Value>| async move { Json(body) }),
            );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_list_items_gain_type_meta() {
        let body = json!({"items": [{"metadata": {"name": "a"}}, {"apiVersion": "v1", "kind": "Secret"}]});
        let items = list_items(body, &vm_gvk());
        assert_eq!(items[0]["apiVersion"], "hobbyfarm.io/v1");
        assert_eq!(items[0]["kind"], "VirtualMachine");
        assert_eq!(items[1]["kind"], "Secret");

        assert!(list_items(json!({"kind": "List"}), &vm_gvk()).is_empty());
    }

    #[tokio::test]
    async fn test_status_codes_map_to_storage_errors() {
        let store = HttpResourceStore::new(&fake_api_server().await);
        let missing = ResourceKey::new(vm_gvk(), "hobbyfarm", "vm-9");
        let existing = ResourceKey::new(vm_gvk(), "hobbyfarm", "vm-1");

        assert!(store.get(&missing).await.unwrap_err().is_not_found());
        assert_eq!(store.get(&existing).await.unwrap()["metadata"]["name"], "vm-1");

        let err = store.create(&existing, json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));

        let stale = json!({"metadata": {"name": "vm-1", "resourceVersion": "3"}});
        let err = store.update(&existing, stale.clone()).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { ref expected, .. } if expected == "3"));

        let written = store.update_status(&existing, stale).await.unwrap();
        assert_eq!(written["metadata"]["resourceVersion"], "3");
    }

    #[tokio::test]
    async fn test_list_uses_collection_path() {
        let store = HttpResourceStore::new(&fake_api_server().await);
        let items = store.list(&vm_gvk(), "hobbyfarm").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["kind"], "VirtualMachine");
    }
}
