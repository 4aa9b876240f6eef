//! Persistence of raw responses. The dispatcher never depends on a sink
//! succeeding; write failures are logged by the caller and dropped.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

const BINARY_FIELDS: &[&str] = &["b64_json"];

/// One decoded response as handed to a sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub task_id: u64,
    pub cycle: u64,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    /// Decoded body; absent when the body was not JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Body text as received, kept when it could not be decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// Destination for decoded responses.
pub trait ResponseSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn persist<'a>(
        &'a self,
        record: ResponseRecord,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>>;
}

/// Writes `response_<task_id>.json` files into a directory, with large
/// base64 payloads replaced by a size marker.
pub struct JsonDirSink {
    dir: PathBuf,
}

impl JsonDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: u64) -> PathBuf {
        self.dir.join(format!("response_{task_id}.json"))
    }
}

impl ResponseSink for JsonDirSink {
    fn name(&self) -> &'static str {
        "json-dir"
    }

    fn persist<'a>(
        &'a self,
        mut record: ResponseRecord,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(response) = record.response.as_mut() {
                trim_binary_fields(response);
            }
            let path = self.path_for(record.task_id);
            let json = serde_json::to_string_pretty(&record)?;
            tokio::fs::write(path, json).await
        })
    }
}

/// Replace base64 blobs anywhere in `value` with `[BASE64_DATA_REMOVED - N bytes]`.
pub fn trim_binary_fields(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if BINARY_FIELDS.contains(&key.as_str()) {
                    if let Some(len) = field.as_str().map(str::len) {
                        *field = serde_json::Value::String(format!(
                            "[BASE64_DATA_REMOVED - {len} bytes]"
                        ));
                        continue;
                    }
                }
                trim_binary_fields(field);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(trim_binary_fields),
        _ => {}
    }
}
