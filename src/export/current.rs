//! Sink for clusters at 6.0 and later

use super::http::{EsClient, Payload, RETRY_ON_STATUS};
use super::sink::{ApiVersion, BulkResponse, IndexSink};
use crate::error::Result;
use crate::models::BulkItem;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

pub struct CurrentSink {
    client: EsClient,
}

impl CurrentSink {
    /// Transient statuses (429, 502, 503, 504) are retried up to `max_retries` times
    pub fn new(client: EsClient, max_retries: usize) -> Self {
        Self {
            client: client.with_retries(max_retries, &RETRY_ON_STATUS),
        }
    }
}

#[async_trait]
impl IndexSink for CurrentSink {
    fn api(&self) -> ApiVersion {
        ApiVersion::Current
    }

    fn client(&self) -> &EsClient {
        &self.client
    }

    fn bulk_action(&self, item: &BulkItem) -> String {
        let mut meta = Map::new();
        if let Some(id) = &item.document_id {
            meta.insert("_id".to_string(), Value::String(id.clone()));
        }
        json!({ "index": meta }).to_string()
    }

    async fn bulk_submit(&self, index: &str, body: String) -> Result<BulkResponse> {
        self.client
            .post(&format!("{}/_bulk", index), Payload::NdJson(body))
            .await?
            .error_for_status("bulk request failed")?
            .json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bulk_action_has_no_type() {
        let client = EsClient::new("http://127.0.0.1:9200", None, Duration::from_secs(1)).unwrap();
        let sink = CurrentSink::new(client, 3);
        let item = BulkItem {
            document_id: Some("sku-\"1\"".to_string()),
            body: "{}".to_string(),
        };
        assert_eq!(sink.bulk_action(&item), r#"{"index":{"_id":"sku-\"1\""}}"#);
        let anonymous = BulkItem {
            document_id: None,
            body: "{}".to_string(),
        };
        assert_eq!(sink.bulk_action(&anonymous), r#"{"index":{}}"#);
    }
}
