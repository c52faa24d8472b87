//! Export from the staging store into a fresh physical index
//!
//! Each run creates `<index_name>_<timestamp>` from the site's settings and
//! mapping templates, streams every `sql-export/*.sql` query result through
//! the field transformer into the bulk indexer, and reports per-document
//! success and failure counts. Moving the alias is a separate step.

mod alias;
mod bulk;
mod cleanup;
mod current;
mod http;
mod legacy;
mod sink;

pub use alias::{is_system_index, swap_alias, AliasChange};
pub use bulk::{BulkIndexer, BulkSettings};
pub use cleanup::{clean_orphans, orphaned_indices};
pub use current::CurrentSink;
pub use http::{parse_nodes, EsClient, EsResponse, Payload, RETRY_ON_STATUS};
pub use legacy::{normalize_doc_type, LegacySink};
pub use sink::{compare_versions, AliasTable, ApiVersion, BulkItemResult, BulkResponse, IndexSink};

use crate::config::{Config, SiteConfig};
use crate::error::{Error, Result};
use crate::models::{BulkItem, SyncOutcome};
use crate::progress::{advance_progress, finish_progress, start_progress_bar};
use crate::sql::{is_select, scan_sql_files};
use crate::staging::StagingStore;
use crate::transform::{transform_document, Document};
use async_trait::async_trait;
use chrono::{FixedOffset, Local, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The export half of a sync, as seen by the orchestration layer
#[async_trait]
pub trait IndexExport: Send + Sync {
    /// Physical index this run writes to
    fn index_name(&self) -> &str;

    /// Create the index and bulk-load every export query
    async fn run(&self) -> Result<SyncOutcome>;

    /// Point the site alias at [`IndexExport::index_name`]
    async fn alias(&self) -> Result<AliasChange>;
}

/// Build the sink matching the site's engine version
pub fn build_sink(config: &Config, site: &SiteConfig) -> Result<Arc<dyn IndexSink>> {
    if site.cluster_nodes().is_empty() {
        return Err(Error::Config(format!(
            "site {}: require es cluster addr",
            site.site
        )));
    }
    info!("es cluster: {}", site.es_cluster);
    let client = EsClient::new(
        &site.es_cluster,
        site.es_api_key.as_deref(),
        Duration::from_secs(config.export.timeout_secs),
    )?;
    let sink: Arc<dyn IndexSink> = match ApiVersion::for_version(&site.es_version) {
        ApiVersion::Current => Arc::new(CurrentSink::new(client, config.export.max_retries)),
        ApiVersion::Legacy => Arc::new(LegacySink::new(
            client,
            &site.doc_type_name,
            config.paths.storage_dir.clone(),
        )),
    };
    Ok(sink)
}

/// Replace `{host}`, `{site}` and `{lang}` in a settings or mapping template
pub fn render_template(template: &str, host: &str, site: &str, lang: &str) -> String {
    template
        .replace("{host}", host)
        .replace("{site}", site)
        .replace("{lang}", lang)
}

/// Body of the index creation request
pub fn index_body(settings: &str, mappings: &str) -> String {
    format!(
        "{{\n  \"settings\": {},\n  \"mappings\": {}\n}}",
        settings.trim(),
        mappings.trim()
    )
}

/// Parse `UTC`, `Z`, `+08:00`, `-0530` or `+8`. Named zones are not supported.
pub fn fixed_offset(tz: &str) -> Option<FixedOffset> {
    let tz = tz.trim();
    if ["UTC", "GMT", "Z"].iter().any(|z| tz.eq_ignore_ascii_case(z)) {
        return FixedOffset::east_opt(0);
    }
    let (sign, rest) = match tz.as_bytes().first()? {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return None,
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes >= 60 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// `<prefix>_<YYYYmmddHHMMSS>` in the site time zone
pub fn generate_index_name(prefix: &str, time_zone: &str) -> String {
    const FORMAT: &str = "%Y%m%d%H%M%S";
    let stamp = if time_zone.trim().is_empty() {
        Local::now().format(FORMAT).to_string()
    } else {
        match fixed_offset(time_zone) {
            Some(offset) => Utc::now().with_timezone(&offset).format(FORMAT).to_string(),
            None => {
                warn!("unsupported time_zone '{}', using local time", time_zone);
                Local::now().format(FORMAT).to_string()
            }
        }
    };
    format!("{}_{}", prefix, stamp)
}

/// Document id from the configured key column; null or missing means the
/// engine assigns one
pub fn document_id(doc: &Document, key: &str) -> Option<String> {
    match doc.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Exports one site's staging store
pub struct Exporter {
    sink: Arc<dyn IndexSink>,
    staging: Arc<StagingStore>,
    site: SiteConfig,
    app_host: String,
    site_dir: PathBuf,
    export_dir: PathBuf,
    bulk: BulkSettings,
    index_name: String,
    debug: bool,
    show_progress: bool,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(
        config: &Config,
        site: &SiteConfig,
        staging: Arc<StagingStore>,
        cancel: CancellationToken,
        debug: bool,
    ) -> Result<Self> {
        let sink = build_sink(config, site)?;
        let flush_items = match sink.api() {
            ApiVersion::Current => None,
            ApiVersion::Legacy => Some(config.export.flush_items),
        };
        Ok(Self {
            bulk: BulkSettings {
                workers: config.export.resolved_workers(),
                flush_bytes: config.export.flush_bytes,
                flush_items,
            },
            index_name: generate_index_name(&site.index_name, &site.time_zone),
            site_dir: config.paths.site_dir(&site.site),
            export_dir: config.paths.export_dir(&site.site),
            app_host: config.app_host.clone(),
            site: site.clone(),
            sink,
            staging,
            debug,
            show_progress: false,
            cancel,
        })
    }

    /// Use a given physical index name instead of a generated one
    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn api(&self) -> ApiVersion {
        self.sink.api()
    }

    fn read_template(&self, name: &str) -> Result<String> {
        let path = self.site_dir.join(name);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::Template(format!("read {}: {}", path.display(), e)))?;
        Ok(render_template(
            &text,
            &self.app_host,
            &self.site.site,
            &self.site.lang,
        ))
    }

    async fn create_index(&self) -> Result<()> {
        let (setting_file, mapping_file) = self.sink.api().template_files();
        let settings = self.read_template(setting_file)?;
        let mappings = self.read_template(mapping_file)?;
        let body = index_body(&settings, &mappings);
        if self.debug {
            info!("{}", body);
        } else {
            debug!("{}", body);
        }
        self.sink.create_index(&self.index_name, body).await
    }

    /// Run one export template; returns the number of documents queued
    async fn load_file(
        &self,
        file: &Path,
        indexer: &BulkIndexer,
        logged_first: &mut bool,
    ) -> Result<u64> {
        info!("Load File: {}", file.display());
        let sql = std::fs::read_to_string(file)?;
        if self.debug {
            info!("{}", sql);
        }
        if !is_select(&sql) {
            self.staging.execute_script(&sql).await?;
            return Ok(0);
        }

        let key = self.site.doc_id_key.as_str();
        let mut queued = 0;
        let mut rows = self.staging.fetch(&sql);
        while let Some(row) = rows.next().await {
            let record = match row {
                Ok(record) => record,
                Err(Error::RowDecode(reason)) => {
                    warn!("{} error scanning row: {}", file.display(), reason);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut doc = record.into_document();
            transform_document(&mut doc);
            let document_id = document_id(&doc, key);
            let body = match serde_json::to_string(&doc) {
                Ok(body) => body,
                Err(e) => {
                    warn!("cannot encode document {:?}: {}", document_id, e);
                    continue;
                }
            };
            if !*logged_first {
                info!("{}", body);
                *logged_first = true;
            }
            indexer.add(BulkItem { document_id, body }).await?;
            queued += 1;
        }
        Ok(queued)
    }
}

#[async_trait]
impl IndexExport for Exporter {
    fn index_name(&self) -> &str {
        &self.index_name
    }

    async fn run(&self) -> Result<SyncOutcome> {
        if !self.export_dir.is_dir() {
            return Err(Error::Template(format!(
                "site {} has no sql-export directory",
                self.site.site
            )));
        }
        let files = scan_sql_files(&self.export_dir)?;
        self.create_index().await?;

        let started = Instant::now();
        let indexer = BulkIndexer::start(Arc::clone(&self.sink), &self.index_name, self.bulk);
        let pb = if self.show_progress {
            start_progress_bar(files.len(), "export")
        } else {
            None
        };
        let mut logged_first = false;
        for file in &files {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.load_file(file, &indexer, &mut logged_first).await {
                Ok(n) => debug!("{}: {} documents queued", file.display(), n),
                Err(e) => warn!("{}: {}", file.display(), e),
            }
            advance_progress(&pb, &file.display().to_string());
        }
        finish_progress(pb, "export queued");

        let outcome = indexer.close(&self.cancel).await?;
        info!(
            index = %self.index_name,
            success = outcome.success,
            failure = outcome.failure,
            rate = outcome.success_rate(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "export done"
        );
        Ok(outcome)
    }

    async fn alias(&self) -> Result<AliasChange> {
        swap_alias(self.sink.as_ref(), &self.site.alias_name, &self.index_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RowBatch, RowValue};
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Acknowledges each document of a bulk body; ids listed in `fail` get a 400
    struct BulkResponder {
        fail: Vec<String>,
        bodies: Arc<Mutex<Vec<String>>>,
    }

    impl Respond for BulkResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body = String::from_utf8_lossy(&request.body).to_string();
            self.bodies.lock().unwrap().push(body.clone());
            let items: Vec<Value> = body
                .lines()
                .step_by(2)
                .map(|line| {
                    let action: Value = serde_json::from_str(line).unwrap();
                    let id = action["index"]["_id"].as_str().unwrap_or("").to_string();
                    let status = if self.fail.contains(&id) { 400 } else { 201 };
                    json!({"index": {"_id": id, "status": status}})
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": items}))
        }
    }

    struct Fixture {
        tmp: TempDir,
        config: Config,
        staging: Arc<StagingStore>,
    }

    async fn fixture(with_templates: bool) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = Config::default().with_base_dir(tmp.path());
        let site_dir = config.paths.site_dir("shop");
        std::fs::create_dir_all(config.paths.export_dir("shop")).unwrap();
        if with_templates {
            for suffix in ["", "_v5"] {
                std::fs::write(
                    site_dir.join(format!("setting{}.json", suffix)),
                    r#"{
                        "index": {"number_of_shards": 1},
                        "analysis": {"site": "{site}", "host": "{host}"}
                    }"#,
                )
                .unwrap();
                std::fs::write(
                    site_dir.join(format!("mapping{}.json", suffix)),
                    r#"{"properties": {"title_{lang}": {"type": "text"}}}"#,
                )
                .unwrap();
            }
        }
        std::fs::write(
            config.paths.export_dir("shop").join("00_prepare.sql"),
            "UPDATE products SET title = upper(title)",
        )
        .unwrap();
        std::fs::write(
            config.paths.export_dir("shop").join("products.sql"),
            "SELECT id, title, categories FROM products ORDER BY id",
        )
        .unwrap();

        let staging = StagingStore::open(&config.paths.staging_db("shop"), 2).await.unwrap();
        staging
            .recreate_table(
                "products",
                "CREATE TABLE \"products\" (\"id\" INTEGER, \"title\" TEXT, \"categories\" TEXT)",
            )
            .await
            .unwrap();
        let mut batch = RowBatch::new(
            "products",
            vec!["id".to_string(), "title".to_string(), "categories".to_string()].into(),
        );
        for id in 1..=5i64 {
            batch.push(vec![
                RowValue::Integer(id),
                RowValue::Text(format!("item {}", id)),
                RowValue::Text("[\"shoes\"]".to_string()),
            ]);
        }
        staging.insert_batch(&batch).await.unwrap();

        Fixture {
            tmp,
            config,
            staging: Arc::new(staging),
        }
    }

    fn site(server: &MockServer, es_version: &str) -> SiteConfig {
        let mut site: SiteConfig = toml::from_str(&format!(
            r#"
            data_source = "main"
            site = "shop"
            es_version = "{}"
            es_cluster = "{}"
            index_name = "shop"
            lang = "en"
            doc_type_name = "_product"
            "#,
            es_version,
            server.uri()
        ))
        .unwrap();
        site.normalize();
        site
    }

    #[tokio::test]
    async fn test_current_export_counts_documents() {
        let f = fixture(true).await;
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/shop_test"))
            .and(body_json(json!({
                "settings": {
                    "index": {"number_of_shards": 1},
                    "analysis": {"site": "shop", "host": f.config.app_host}
                },
                "mappings": {"properties": {"title_en": {"type": "text"}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;
        let bodies = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("POST"))
            .and(path("/shop_test/_bulk"))
            .respond_with(BulkResponder {
                fail: vec!["5".to_string()],
                bodies: bodies.clone(),
            })
            .mount(&server)
            .await;

        let exporter = Exporter::new(
            &f.config,
            &site(&server, "8.11.0"),
            f.staging.clone(),
            CancellationToken::new(),
            false,
        )
        .unwrap()
        .with_index_name("shop_test");
        assert_eq!(exporter.api(), ApiVersion::Current);

        let outcome = exporter.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::new(4, 1));
        assert_eq!(outcome.success_rate(), 80);

        let sent = bodies.lock().unwrap().join("");
        assert!(sent.contains(r#"{"index":{"_id":"1"}}"#));
        assert!(sent.contains(r#""title":"ITEM 1""#), "{}", sent);
        assert!(sent.contains(r#""categories":["shoes"]"#), "{}", sent);
    }

    #[tokio::test]
    async fn test_legacy_export_captures_rejected_batch() {
        let f = fixture(true).await;
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/shop_v5"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/shop_v5/product/_bulk"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "illegal_argument_exception", "reason": "bad bulk"},
                "status": 400
            })))
            .mount(&server)
            .await;

        let exporter = Exporter::new(
            &f.config,
            &site(&server, "5.6.16"),
            f.staging.clone(),
            CancellationToken::new(),
            false,
        )
        .unwrap()
        .with_index_name("shop_v5");
        assert_eq!(exporter.api(), ApiVersion::Legacy);

        let outcome = exporter.run().await.unwrap();
        assert_eq!(outcome, SyncOutcome::new(0, 5));

        let captured = std::fs::read_to_string(f.config.paths.failure_capture("shop_v5")).unwrap();
        assert_eq!(captured.lines().count(), 10);
        assert!(captured.contains(r#""_type":"product""#));
        drop(f.tmp);
    }

    #[tokio::test]
    async fn test_missing_templates_is_setup_error() {
        let f = fixture(false).await;
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let exporter = Exporter::new(
            &f.config,
            &site(&server, "7.17"),
            f.staging.clone(),
            CancellationToken::new(),
            false,
        )
        .unwrap();
        assert!(matches!(exporter.run().await, Err(Error::Template(_))));
    }

    #[tokio::test]
    async fn test_index_creation_failure_is_fatal() {
        let f = fixture(true).await;
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("resource_already_exists_exception"),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let exporter = Exporter::new(
            &f.config,
            &site(&server, "7.17"),
            f.staging.clone(),
            CancellationToken::new(),
            false,
        )
        .unwrap();
        assert!(matches!(exporter.run().await, Err(Error::IndexEngine(_))));
    }

    #[test]
    fn test_empty_cluster_is_config_error() {
        let config = Config::default();
        let site: SiteConfig = toml::from_str(
            r#"
            data_source = "main"
            index_name = "shop"
            "#,
        )
        .unwrap();
        assert!(matches!(build_sink(&config, &site), Err(Error::Config(_))));
    }

    #[test]
    fn test_render_template() {
        assert_eq!(
            render_template("{host}/{site}/{lang}/{site}", "http://h", "shop", "de"),
            "http://h/shop/de/shop"
        );
    }

    #[test]
    fn test_fixed_offset() {
        assert_eq!(fixed_offset("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(fixed_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(fixed_offset("-0530").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(fixed_offset("+8").unwrap().local_minus_utc(), 8 * 3600);
        assert!(fixed_offset("Asia/Shanghai").is_none());
        assert!(fixed_offset("+25:00").is_none());
    }

    #[test]
    fn test_generate_index_name() {
        let name = generate_index_name("shop", "+00:00");
        let stamp = name.strip_prefix("shop_").unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
        assert!(generate_index_name("shop", "Mars/Olympus").starts_with("shop_"));
    }

    #[test]
    fn test_document_id() {
        let doc: Document =
            serde_json::from_value(json!({"id": 42, "sku": "A-1", "none": null})).unwrap();
        assert_eq!(document_id(&doc, "id").as_deref(), Some("42"));
        assert_eq!(document_id(&doc, "sku").as_deref(), Some("A-1"));
        assert_eq!(document_id(&doc, "none"), None);
        assert_eq!(document_id(&doc, "missing"), None);
    }
}
