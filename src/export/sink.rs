//! Index sink abstraction over the two supported engine API generations

use super::http::{EsClient, EsResponse, Payload};
use crate::error::{Error, Result};
use crate::models::BulkItem;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

/// Which bulk/document protocol a cluster speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// 6.0 and later: typeless documents
    Current,
    /// Before 6.0: every document carries a mapping type
    Legacy,
}

impl ApiVersion {
    pub const BOUNDARY: &'static str = "6.0";

    /// Pick the API for a configured engine version. Empty or unparsable
    /// versions use the current API.
    pub fn for_version(version: &str) -> Self {
        match compare_versions(version, Self::BOUNDARY) {
            Some(Ordering::Less) => ApiVersion::Legacy,
            Some(_) => ApiVersion::Current,
            None => {
                warn!("cannot compare es_version '{}', using the current API", version);
                ApiVersion::Current
            }
        }
    }

    /// (settings, mapping) template file names
    pub fn template_files(&self) -> (&'static str, &'static str) {
        match self {
            ApiVersion::Current => ("setting.json", "mapping.json"),
            ApiVersion::Legacy => ("setting_v5.json", "mapping_v5.json"),
        }
    }
}

/// Dotted numeric comparison; missing components count as zero, so `6`
/// equals `6.0`. `None` when either side is empty or non-numeric.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    fn parse(v: &str) -> Option<Vec<u64>> {
        let v = v.trim();
        if v.is_empty() {
            return None;
        }
        v.split('.').map(|part| part.trim().parse().ok()).collect()
    }
    let (a, b) = (parse(a)?, parse(b)?);
    let len = a.len().max(b.len());
    let at = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
    Some(
        (0..len)
            .map(|i| at(&a, i).cmp(&at(&b, i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal),
    )
}

/// Engine reply to one bulk request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<HashMap<String, BulkItemResult>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkItemResult {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub error: Option<Value>,
}

impl BulkItemResult {
    /// Anything above 201 or carrying an error object is a failure
    pub fn is_failure(&self) -> bool {
        self.status > 201 || self.error.is_some()
    }

    fn error_summary(&self) -> String {
        let field = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).unwrap_or("").to_string();
        match &self.error {
            Some(err) => {
                let cause = err.get("caused_by").cloned().unwrap_or(Value::Null);
                format!(
                    "{}: {}: {}: {}",
                    field(err, "type"),
                    field(err, "reason"),
                    field(&cause, "type"),
                    field(&cause, "reason")
                )
            }
            None => String::new(),
        }
    }
}

impl BulkResponse {
    /// (success, failure) per-item tallies; failures are logged
    pub fn tally(&self) -> (u64, u64) {
        let mut success = 0;
        let mut failure = 0;
        for item in self.items.iter().flat_map(|entry| entry.values()) {
            if item.is_failure() {
                failure += 1;
                warn!(
                    "error: [{}] DocumentID: {} {}",
                    item.status,
                    item.id.as_deref().unwrap_or(""),
                    item.error_summary()
                );
            } else {
                success += 1;
            }
        }
        (success, failure)
    }
}

/// Index bindings reported by `GET /_alias`: index name → alias names
pub type AliasTable = BTreeMap<String, Vec<String>>;

#[derive(Debug, Deserialize)]
struct IndexAliases {
    #[serde(default)]
    aliases: HashMap<String, Value>,
}

fn parse_alias_table(res: &EsResponse) -> Result<AliasTable> {
    let raw: HashMap<String, IndexAliases> = res.json()?;
    Ok(raw
        .into_iter()
        .map(|(index, entry)| {
            let mut names: Vec<String> = entry.aliases.into_keys().collect();
            names.sort();
            (index, names)
        })
        .collect())
}

/// Operations the exporter, alias swap and cleanup need from the engine.
///
/// Alias and index management is identical across API generations and is
/// provided here; implementors supply the bulk protocol.
#[async_trait]
pub trait IndexSink: Send + Sync {
    fn api(&self) -> ApiVersion;

    fn client(&self) -> &EsClient;

    /// Bulk action line for one document, without the trailing newline
    fn bulk_action(&self, item: &BulkItem) -> String;

    /// Submit an NDJSON bulk body. A non-2xx reply is an error.
    async fn bulk_submit(&self, index: &str, body: String) -> Result<BulkResponse>;

    /// Called with the raw body of a bulk request that failed as a whole
    async fn on_batch_rejected(&self, index: &str, body: &str) {
        warn!("bulk request to {} rejected ({} bytes)", index, body.len());
    }

    async fn create_index(&self, index: &str, body: String) -> Result<()> {
        info!("ready to create new index: {}", index);
        self.client()
            .put(index, Some(Payload::RawJson(body)))
            .await?
            .error_for_status("cannot create es index")?;
        Ok(())
    }

    async fn alias_exists(&self, alias: &str) -> Result<bool> {
        let res = self.client().head(&format!("_alias/{}", alias)).await?;
        match res.status.as_u16() {
            404 => Ok(false),
            _ => res.error_for_status("alias exists check failed").map(|_| true),
        }
    }

    /// Indices currently bound to `alias`
    async fn alias_get(&self, alias: &str) -> Result<Vec<String>> {
        let res = self
            .client()
            .get(&format!("_alias/{}", alias))
            .await?
            .error_for_status("get alias error")?;
        info!("old alias: {}", res.body);
        Ok(parse_alias_table(&res)?.into_keys().collect())
    }

    async fn alias_put(&self, index: &str, alias: &str) -> Result<()> {
        self.client()
            .put(&format!("{}/_alias/{}", index, alias), None)
            .await?
            .error_for_status("put alias error")?;
        Ok(())
    }

    /// Move `alias` from `old` to `new` in one request: removals first, then the add
    async fn alias_swap(&self, old: &[String], new: &str, alias: &str) -> Result<()> {
        let mut actions: Vec<Value> = old
            .iter()
            .map(|index| json!({"remove": {"index": index, "alias": alias}}))
            .collect();
        actions.push(json!({"add": {"index": new, "alias": alias}}));
        let body = json!({ "actions": actions });
        let res = self
            .client()
            .post("_aliases", Payload::Json(body))
            .await
            .map_err(|e| Error::AliasProtocol(format!("update alias fail: {}", e)))?
            .error_for_status("update alias error")?;
        info!("{}", res.body);
        Ok(())
    }

    /// Every index with its aliases, including indices with none
    async fn list_aliases(&self) -> Result<AliasTable> {
        let res = self
            .client()
            .get("_alias")
            .await?
            .error_for_status("list aliases error")?;
        parse_alias_table(&res)
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let res = self
            .client()
            .delete(&indices.join(","))
            .await?
            .error_for_status("delete index error")?;
        info!("{}", res.body);
        Ok(())
    }
}
