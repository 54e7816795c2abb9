//! Object-store abstraction for archived audio.
//!
//! The gateway treats blob storage as an external collaborator behind the
//! [`ObjectStore`] trait: archived chunks are PUT with custom metadata, and
//! the administrative endpoints list, download and delete them. Two
//! implementations ship here: the in-process [`MemoryObjectStore`] (tests,
//! single-node evaluation) and [`HttpObjectStore`], a thin adapter for a
//! REST blob gateway.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::state::ObjectStoreConfig;

/// Custom metadata attached to every archived chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveMetadata {
    pub session_id: String,
    /// `"original"` for the raw stream, `"vad"` for utterance segments.
    pub audio_type: String,
    pub chunk_index: u64,
    /// Running count of chunks uploaded by this session's archiver.
    pub chunk_count: u64,
    /// ISO-8601 timestamp of the oldest frame in the chunk.
    pub start_timestamp: String,
    /// ISO-8601 timestamp of the newest frame in the chunk.
    pub end_timestamp: String,
    pub duration_seconds: f64,
    /// ISO-8601 upload time; the retention sweep keys off this.
    pub uploaded_at: String,
}

/// Descriptor of a stored object (no payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: usize,
    pub content_type: String,
    pub metadata: ArchiveMetadata,
}

/// A stored object with its payload.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub info: ObjectInfo,
    pub data: Bytes,
}

/// Put/get/head/list/delete over blobs with custom metadata.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ArchiveMetadata,
    ) -> GatewayResult<()>;

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredObject>>;

    async fn head(&self, key: &str) -> GatewayResult<Option<ObjectInfo>>;

    /// Lists descriptors for every object whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> GatewayResult<Vec<ObjectInfo>>;

    /// Returns `true` if an object existed and was deleted.
    async fn delete(&self, key: &str) -> GatewayResult<bool>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-Process Store
// ─────────────────────────────────────────────────────────────────────────────

/// In-process blob map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the store holds no objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ArchiveMetadata,
    ) -> GatewayResult<()> {
        let info = ObjectInfo {
            key: key.to_string(),
            size: data.len(),
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        };
        self.objects
            .insert(key.to_string(), StoredObject { info, data });
        Ok(())
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredObject>> {
        Ok(self.objects.get(key).map(|r| r.value().clone()))
    }

    async fn head(&self, key: &str) -> GatewayResult<Option<ObjectInfo>> {
        Ok(self.objects.get(key).map(|r| r.value().info.clone()))
    }

    async fn list(&self, prefix: &str) -> GatewayResult<Vec<ObjectInfo>> {
        let mut infos: Vec<ObjectInfo> = self
            .objects
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.value().info.clone())
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        Ok(self.objects.remove(key).is_some())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Blob-Gateway Adapter
// ─────────────────────────────────────────────────────────────────────────────

/// Prefix for per-field metadata headers (`x-meta-chunk-index: 3` style).
const META_PREFIX: &str = "x-meta-";

fn meta_header_name(field: &str) -> String {
    format!("{META_PREFIX}{field}")
}

/// Renders a metadata record as its `x-meta-*` header pairs.
fn meta_headers(metadata: &ArchiveMetadata) -> Vec<(String, String)> {
    vec![
        (meta_header_name("session-id"), metadata.session_id.clone()),
        (meta_header_name("audio-type"), metadata.audio_type.clone()),
        (meta_header_name("chunk-index"), metadata.chunk_index.to_string()),
        (meta_header_name("chunk-count"), metadata.chunk_count.to_string()),
        (
            meta_header_name("start-timestamp"),
            metadata.start_timestamp.clone(),
        ),
        (
            meta_header_name("end-timestamp"),
            metadata.end_timestamp.clone(),
        ),
        (
            meta_header_name("duration-seconds"),
            metadata.duration_seconds.to_string(),
        ),
        (meta_header_name("uploaded-at"), metadata.uploaded_at.clone()),
    ]
}

fn meta_value(
    headers: &reqwest::header::HeaderMap,
    field: &str,
    key: &str,
) -> GatewayResult<String> {
    headers
        .get(meta_header_name(field))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            GatewayError::Storage(format!(
                "object {key} is missing {META_PREFIX}{field}"
            ))
        })
}

fn meta_parsed<T: std::str::FromStr>(
    headers: &reqwest::header::HeaderMap,
    field: &str,
    key: &str,
) -> GatewayResult<T> {
    meta_value(headers, field, key)?.parse().map_err(|_| {
        GatewayError::Storage(format!("object {key} has a malformed {META_PREFIX}{field}"))
    })
}

/// Rebuilds a metadata record from a response's `x-meta-*` headers.
fn parse_metadata(
    key: &str,
    headers: &reqwest::header::HeaderMap,
) -> GatewayResult<ArchiveMetadata> {
    Ok(ArchiveMetadata {
        session_id: meta_value(headers, "session-id", key)?,
        audio_type: meta_value(headers, "audio-type", key)?,
        chunk_index: meta_parsed(headers, "chunk-index", key)?,
        chunk_count: meta_parsed(headers, "chunk-count", key)?,
        start_timestamp: meta_value(headers, "start-timestamp", key)?,
        end_timestamp: meta_value(headers, "end-timestamp", key)?,
        duration_seconds: meta_parsed(headers, "duration-seconds", key)?,
        uploaded_at: meta_value(headers, "uploaded-at", key)?,
    })
}

/// Adapter for a REST blob gateway: `{endpoint}/{bucket}/{key}` with bearer
/// auth, each metadata field as its own `x-meta-*` request/response header,
/// and listing via `GET {endpoint}/{bucket}?prefix=`.
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    token: Option<String>,
}

impl HttpObjectStore {
    /// Builds an adapter from config; `None` if no endpoint is configured.
    pub fn from_config(config: &ObjectStoreConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone().unwrap_or_else(|| "audio".to_string()),
            token: config.token.clone(),
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn info_from_headers(
        key: &str,
        size: usize,
        headers: &reqwest::header::HeaderMap,
    ) -> GatewayResult<ObjectInfo> {
        let metadata = parse_metadata(key, headers)?;
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            content_type,
            metadata,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ArchiveMetadata,
    ) -> GatewayResult<()> {
        let mut req = self
            .authorize(self.client.put(self.object_url(key)))
            .header(reqwest::header::CONTENT_TYPE, content_type);
        for (name, value) in meta_headers(metadata) {
            req = req.header(name.as_str(), value);
        }
        let resp = req
            .body(data)
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("PUT {key} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Storage(format!(
                "PUT {key} returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> GatewayResult<Option<StoredObject>> {
        let resp = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("GET {key} failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(GatewayError::Storage(format!(
                "GET {key} returned {}",
                resp.status()
            )));
        }
        let headers = resp.headers().clone();
        let data = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Storage(format!("GET {key} body read failed: {e}")))?;
        let info = Self::info_from_headers(key, data.len(), &headers)?;
        Ok(Some(StoredObject { info, data }))
    }

    async fn head(&self, key: &str) -> GatewayResult<Option<ObjectInfo>> {
        let resp = self
            .authorize(self.client.head(self.object_url(key)))
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("HEAD {key} failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(GatewayError::Storage(format!(
                "HEAD {key} returned {}",
                resp.status()
            )));
        }
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Self::info_from_headers(key, size, resp.headers()).map(Some)
    }

    async fn list(&self, prefix: &str) -> GatewayResult<Vec<ObjectInfo>> {
        let url = format!("{}/{}", self.endpoint, self.bucket);
        let resp = self
            .authorize(self.client.get(url).query(&[("prefix", prefix)]))
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("LIST {prefix} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Storage(format!(
                "LIST {prefix} returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| GatewayError::Storage(format!("LIST {prefix} decode failed: {e}")))
    }

    async fn delete(&self, key: &str) -> GatewayResult<bool> {
        let resp = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(|e| GatewayError::Storage(format!("DELETE {key} failed: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(GatewayError::Storage(format!(
                "DELETE {key} returned {}",
                resp.status()
            )));
        }
        Ok(true)
    }
}
