//! Sync command: import → export → success gate → alias

use crate::config::{Config, PathsConfig, SiteConfig};
use crate::error::{Error, Result};
use crate::export::{AliasChange, Exporter, IndexExport};
use crate::import::{ImportOptions, ImportStats, Importer};
use crate::models::SyncOutcome;
use crate::source::{ConfigResolver, SourceDb, SourceResolver};
use crate::staging::StagingStore;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Which steps of a sync to run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub import: bool,
    pub export: bool,
    pub alias: bool,
    /// Connect to the source and staging store, then stop
    pub check: bool,
    pub debug: bool,
    pub show_progress: bool,
}

impl SyncOptions {
    /// No step selected means the full pipeline
    pub fn resolved(mut self) -> Self {
        if !(self.import || self.export || self.alias || self.check) {
            self.import = true;
            self.export = true;
            self.alias = true;
        }
        self
    }
}

/// Result of one sync run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub site: String,
    pub checked_only: bool,
    pub import: Option<ImportStats>,
    pub index: Option<String>,
    pub export: Option<SyncOutcome>,
    pub success_rate: Option<u32>,
    pub alias: Option<AliasChange>,
}

/// Per-site run guard backed by `storage/<site>.lock`
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(paths: &PathsConfig, site: &str) -> Result<Self> {
        std::fs::create_dir_all(&paths.storage_dir)?;
        let path = paths.lock_file(site);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyRunning(format!(
                    "{} (lock file {})",
                    site,
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("cannot remove lock file {}: {}", self.path.display(), e);
        }
    }
}

/// Export, enforce the success threshold, then optionally move the alias.
///
/// A rate below `threshold` is an error and the alias is left alone.
pub async fn export_and_swap(
    exporter: &dyn IndexExport,
    threshold: u32,
    alias: bool,
    report: &mut SyncReport,
) -> Result<()> {
    info!("{} start export...", report.site);
    report.index = Some(exporter.index_name().to_string());
    let outcome = exporter.run().await?;
    let rate = outcome.success_rate();
    report.export = Some(outcome);
    report.success_rate = Some(rate);

    if rate < threshold {
        error!("{} success rate less than {}%: {}%", report.site, threshold, rate);
        return Err(Error::SuccessRateBelowThreshold { rate, threshold });
    }

    if alias {
        info!("{} successRate: {}, start alias ...", report.site, rate);
        report.alias = Some(exporter.alias().await?);
    } else {
        info!("{} successRate: {}, do not alias.", report.site, rate);
    }
    Ok(())
}

/// Run a sync for one site
pub async fn cmd_sync(
    config: &Config,
    site_name: &str,
    options: SyncOptions,
    cancel: CancellationToken,
) -> Result<SyncReport> {
    let options = options.resolved();
    let site = SiteConfig::load(&config.paths, site_name)?;
    let _lock = RunLock::acquire(&config.paths, &site.site)?;

    let workers = config.import.resolved_workers();
    let resolver = Arc::new(ConfigResolver::new(config.paths.clone(), workers as u32));
    let source = resolver.resolve(&site.data_source).await?;
    let staging_path = config.paths.staging_db(&site.site);
    let staging = match StagingStore::open(&staging_path, workers as u32).await {
        Ok(staging) => Arc::new(staging),
        Err(e) => {
            source.close().await;
            return Err(e);
        }
    };

    let mut report = SyncReport {
        site: site.site.clone(),
        checked_only: options.check,
        ..Default::default()
    };

    let result = if options.check {
        info!("{} data sources reachable", site.site);
        Ok(())
    } else {
        run_steps(
            config,
            &site,
            &options,
            resolver,
            Arc::clone(&source),
            Arc::clone(&staging),
            cancel,
            &mut report,
        )
        .await
    };

    source.close().await;
    staging.close().await;

    result.map(|_| {
        info!("{} done...", site.site);
        report
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_steps(
    config: &Config,
    site: &SiteConfig,
    options: &SyncOptions,
    resolver: Arc<dyn SourceResolver>,
    source: Arc<dyn SourceDb>,
    staging: Arc<StagingStore>,
    cancel: CancellationToken,
    report: &mut SyncReport,
) -> Result<()> {
    if options.import {
        info!("{} start import...", site.site);
        let mut import_options = ImportOptions::new(config, site, options.debug);
        import_options.show_progress = options.show_progress;
        let importer = Importer::new(
            import_options,
            source,
            resolver,
            Arc::clone(&staging),
            cancel.clone(),
        );
        report.import = Some(importer.run(&config.paths.import_dir(&site.site)).await?);
    }

    if options.export {
        let exporter = Exporter::new(config, site, staging, cancel, options.debug)?
            .with_progress(options.show_progress);
        export_and_swap(&exporter, config.success_threshold, options.alias, report).await?;
    } else {
        info!("{} do not export.", site.site);
    }
    Ok(())
}

/// Print a sync report to console
pub fn print_sync_report(report: &SyncReport) {
    if report.checked_only {
        println!("✓ {}: data source and staging store reachable", report.site);
        return;
    }

    println!("\n✓ Sync complete: {}", report.site);
    if let Some(import) = &report.import {
        println!("\nImport:");
        println!("  Templates: {} ({} failed)", import.files, import.files_failed);
        println!("  Chunks: {} ({} failed)", import.tasks, import.tasks_failed);
        println!("  Rows read: {}", import.rows_read);
        println!("  Rows written: {}", import.rows_written);
        if import.rows_skipped > 0 {
            println!("  Rows skipped: {}", import.rows_skipped);
        }
    }
    if let (Some(index), Some(export)) = (&report.index, &report.export) {
        println!("\nExport:");
        println!("  Index: {}", index);
        println!("  Indexed: {}", export.success);
        println!("  Failed: {}", export.failure);
        println!("  Success rate: {}%", export.success_rate());
    }
    match &report.alias {
        Some(AliasChange::Created { index }) => println!("\nAlias created -> {}", index),
        Some(AliasChange::Swapped { from, to }) => {
            println!("\nAlias moved {} -> {}", from.join(", "), to)
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SqliteSource;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    struct FakeExport {
        outcome: SyncOutcome,
        alias_calls: AtomicUsize,
    }

    impl FakeExport {
        fn new(success: u64, failure: u64) -> Self {
            Self {
                outcome: SyncOutcome::new(success, failure),
                alias_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IndexExport for FakeExport {
        fn index_name(&self) -> &str {
            "shop_20250101000000"
        }

        async fn run(&self) -> Result<SyncOutcome> {
            Ok(self.outcome)
        }

        async fn alias(&self) -> Result<AliasChange> {
            self.alias_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AliasChange::Created {
                index: self.index_name().to_string(),
            })
        }
    }

    fn report() -> SyncReport {
        SyncReport {
            site: "shop".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gate_blocks_alias_below_threshold() {
        let exporter = FakeExport::new(79, 21);
        let mut report = report();
        let err = export_and_swap(&exporter, 80, true, &mut report).await.unwrap_err();
        assert!(matches!(err, Error::SuccessRateBelowThreshold { rate: 79, threshold: 80 }));
        assert_eq!(exporter.alias_calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.success_rate, Some(79));
    }

    #[tokio::test]
    async fn test_gate_passes_at_threshold() {
        let exporter = FakeExport::new(80, 20);
        let mut report = report();
        export_and_swap(&exporter, 80, true, &mut report).await.unwrap();
        assert_eq!(exporter.alias_calls.load(Ordering::SeqCst), 1);
        assert!(report.alias.is_some());
    }

    #[tokio::test]
    async fn test_gate_applies_without_alias_step() {
        let exporter = FakeExport::new(0, 0);
        let mut report = report();
        let err = export_and_swap(&exporter, 80, false, &mut report).await.unwrap_err();
        assert!(matches!(err, Error::SuccessRateBelowThreshold { rate: 0, .. }));

        let exporter = FakeExport::new(9, 1);
        export_and_swap(&exporter, 80, false, &mut report).await.unwrap();
        assert_eq!(exporter.alias_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_options_default_to_full_pipeline() {
        let full = SyncOptions::default().resolved();
        assert!(full.import && full.export && full.alias);

        let export_only = SyncOptions {
            export: true,
            ..Default::default()
        }
        .resolved();
        assert!(!export_only.import && !export_only.alias);

        let check = SyncOptions {
            check: true,
            ..Default::default()
        }
        .resolved();
        assert!(!check.import && !check.export);
    }

    #[test]
    fn test_run_lock_is_exclusive() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default().with_base_dir(tmp.path());
        let lock = RunLock::acquire(&config.paths, "shop").unwrap();
        assert!(config.paths.lock_file("shop").exists());
        assert!(matches!(
            RunLock::acquire(&config.paths, "shop"),
            Err(Error::AlreadyRunning(_))
        ));
        assert!(RunLock::acquire(&config.paths, "blog").is_ok());
        drop(lock);
        assert!(!config.paths.lock_file("shop").exists());
        assert!(RunLock::acquire(&config.paths, "shop").is_ok());
    }

    /// Acknowledges every document and counts them
    struct CountingBulk {
        docs: Arc<AtomicUsize>,
    }

    impl Respond for CountingBulk {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body = String::from_utf8_lossy(&request.body).to_string();
            let items: Vec<Value> = body
                .lines()
                .step_by(2)
                .map(|_| json!({"index": {"status": 201}}))
                .collect();
            self.docs.fetch_add(items.len(), Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(json!({"errors": false, "items": items}))
        }
    }

    async fn site_fixture(tmp: &TempDir, es: &MockServer) -> Config {
        let config = Config::default().with_base_dir(tmp.path());
        let site_dir = config.paths.site_dir("shop");
        std::fs::create_dir_all(config.paths.import_dir("shop")).unwrap();
        std::fs::create_dir_all(config.paths.export_dir("shop")).unwrap();
        std::fs::create_dir_all(config.paths.etc_dir.join("datasources")).unwrap();

        std::fs::write(
            config.paths.site_file("shop"),
            format!(
                "data_source = \"main\"\nes_version = \"7.17.0\"\nes_cluster = \"{}\"\n\
                 index_name = \"shop\"\nlang = \"en\"\ntime_zone = \"UTC\"\n",
                es.uri()
            ),
        )
        .unwrap();
        std::fs::write(
            config.paths.datasource_file("main"),
            "driver = \"sqlite\"\npath = \"source.db\"\n",
        )
        .unwrap();
        std::fs::write(site_dir.join("setting.json"), "{}").unwrap();
        std::fs::write(site_dir.join("mapping.json"), "{}").unwrap();
        std::fs::write(
            config.paths.import_dir("shop").join("products.sql"),
            "-- key=id\nSELECT id, title FROM products",
        )
        .unwrap();
        std::fs::write(
            config.paths.export_dir("shop").join("products.sql"),
            "SELECT id, title FROM products",
        )
        .unwrap();

        let source = SqliteSource::create(&tmp.path().join("source.db")).await.unwrap();
        source
            .execute(
                "CREATE TABLE products (id INTEGER NOT NULL, title TEXT);
                 INSERT INTO products VALUES (1, 'a'), (2, 'b'), (3, 'c');",
            )
            .await
            .unwrap();
        source.close().await;
        config
    }

    #[tokio::test]
    async fn test_full_sync_twice_yields_equal_indices() {
        let tmp = TempDir::new().unwrap();
        let es = MockServer::start().await;
        let config = site_fixture(&tmp, &es).await;

        let docs = Arc::new(AtomicUsize::new(0));
        Mock::given(method("PUT"))
            .and(path_regex(r"^/shop_\d{14}$"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&es)
            .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/shop_\d{14}/_bulk$"))
            .respond_with(CountingBulk { docs: docs.clone() })
            .mount(&es)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&es)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/shop_\d{14}/_alias/shop$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&es)
            .await;

        let first = cmd_sync(&config, "shop", SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.import.as_ref().unwrap().rows_written, 3);
        assert_eq!(first.export, Some(SyncOutcome::new(3, 0)));
        assert_eq!(first.success_rate, Some(100));
        assert!(matches!(first.alias, Some(AliasChange::Created { .. })));
        assert!(!config.paths.lock_file("shop").exists());

        // Index names have one-second resolution
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = cmd_sync(
            &config,
            "shop",
            SyncOptions {
                import: true,
                export: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(second.export, first.export);
        assert_ne!(second.index, first.index);
        assert!(second.alias.is_none());
        assert_eq!(docs.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_check_only_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let es = MockServer::start().await;
        let config = site_fixture(&tmp, &es).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&es)
            .await;

        let report = cmd_sync(
            &config,
            "shop",
            SyncOptions {
                check: true,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(report.checked_only);
        assert!(report.import.is_none());
        assert!(config.paths.staging_db("shop").exists());
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default().with_base_dir(tmp.path());
        let err = cmd_sync(&config, "nope", SyncOptions::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SiteNotFound(_)));
    }
}
