//! Sink for pre-6.0 clusters: typed documents, no retries, rejected
//! batches captured to disk

use super::http::{EsClient, Payload};
use super::sink::{ApiVersion, BulkResponse, IndexSink};
use crate::error::Result;
use crate::models::BulkItem;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

pub struct LegacySink {
    client: EsClient,
    doc_type: String,
    /// Directory receiving `error_<index>` capture files
    capture_dir: PathBuf,
}

impl LegacySink {
    pub fn new(client: EsClient, doc_type: &str, capture_dir: PathBuf) -> Self {
        Self {
            client,
            doc_type: normalize_doc_type(doc_type),
            capture_dir,
        }
    }

    pub fn capture_file(&self, index: &str) -> PathBuf {
        self.capture_dir.join(format!("error_{}", index))
    }
}

/// Legacy mapping types may not start with an underscore
pub fn normalize_doc_type(doc_type: &str) -> String {
    let trimmed = doc_type.strip_prefix('_').unwrap_or(doc_type);
    if trimmed.is_empty() {
        "doc".to_string()
    } else {
        trimmed.to_string()
    }
}

#[async_trait]
impl IndexSink for LegacySink {
    fn api(&self) -> ApiVersion {
        ApiVersion::Legacy
    }

    fn client(&self) -> &EsClient {
        &self.client
    }

    fn bulk_action(&self, item: &BulkItem) -> String {
        let mut meta = Map::new();
        if let Some(id) = &item.document_id {
            meta.insert("_id".to_string(), Value::String(id.clone()));
        }
        meta.insert("_type".to_string(), Value::String(self.doc_type.clone()));
        json!({ "index": meta }).to_string()
    }

    async fn bulk_submit(&self, index: &str, body: String) -> Result<BulkResponse> {
        let res = self
            .client
            .post(&format!("{}/{}/_bulk", index, self.doc_type), Payload::NdJson(body))
            .await?;
        if !res.is_success() {
            if let Ok(raw) = res.json::<Value>() {
                let err = &raw["error"];
                let kind = err["type"].as_str().unwrap_or("");
                let reason = err["reason"].as_str().unwrap_or("");
                error!("error: [{}] {}: {}", res.status, kind, reason);
            }
            return Err(res.into_error("bulk request failed"));
        }
        res.json()
    }

    async fn on_batch_rejected(&self, index: &str, body: &str) {
        let path = self.capture_file(index);
        let written = async {
            tokio::fs::create_dir_all(&self.capture_dir).await?;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(body.as_bytes()).await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => warn!("rejected batch appended to {}", path.display()),
            Err(e) => error!("cannot write {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink(dir: &TempDir) -> LegacySink {
        let client = EsClient::new("http://127.0.0.1:9200", None, Duration::from_secs(1)).unwrap();
        LegacySink::new(client, "_product", dir.path().join("storage"))
    }

    #[test]
    fn test_doc_type_loses_underscore() {
        assert_eq!(normalize_doc_type("_doc"), "doc");
        assert_eq!(normalize_doc_type("product"), "product");
        assert_eq!(normalize_doc_type(""), "doc");
    }

    #[test]
    fn test_bulk_action_carries_type() {
        let tmp = TempDir::new().unwrap();
        let item = BulkItem {
            document_id: Some("42".to_string()),
            body: "{}".to_string(),
        };
        assert_eq!(
            sink(&tmp).bulk_action(&item),
            r#"{"index":{"_id":"42","_type":"product"}}"#
        );
    }

    #[tokio::test]
    async fn test_bulk_submit_posts_typed_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/shop_1/product/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [{"index": {"_id": "1", "status": 201}}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/shop_2/product/_bulk"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "illegal_argument_exception", "reason": "bad mapping"},
                "status": 400
            })))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let client = EsClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let sink = LegacySink::new(client, "_product", tmp.path().join("storage"));

        let res = sink.bulk_submit("shop_1", "{}\n".to_string()).await.unwrap();
        assert_eq!(res.tally(), (1, 0));

        let err = sink.bulk_submit("shop_2", "{}\n".to_string()).await.unwrap_err();
        match err {
            Error::IndexEngine(msg) => assert!(msg.contains("bad mapping"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_batch_is_appended() {
        let tmp = TempDir::new().unwrap();
        let sink = sink(&tmp);
        sink.on_batch_rejected("shop_1", "a\n").await;
        sink.on_batch_rejected("shop_1", "b\n").await;
        let captured = std::fs::read_to_string(sink.capture_file("shop_1")).unwrap();
        assert_eq!(captured, "a\nb\n");
    }
}
