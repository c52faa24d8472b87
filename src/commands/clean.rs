//! Clean command: delete indices no alias points at

use crate::config::{Config, SiteConfig};
use crate::error::Result;
use crate::export::{build_sink, clean_orphans};
use serde::Serialize;
use tracing::info;

/// Indices removed by a clean run
#[derive(Debug, Clone, Serialize)]
pub struct CleanReport {
    pub site: String,
    pub cluster: String,
    pub deleted: Vec<String>,
}

/// Remove orphaned physical indices from a site's cluster
pub async fn cmd_clean(config: &Config, site_name: &str) -> Result<CleanReport> {
    let site = SiteConfig::load(&config.paths, site_name)?;
    info!("{} start clean...", site.site);
    let sink = build_sink(config, &site)?;
    let deleted = clean_orphans(sink.as_ref()).await?;
    Ok(CleanReport {
        site: site.site,
        cluster: site.es_cluster,
        deleted,
    })
}

pub fn print_clean_report(report: &CleanReport) {
    if report.deleted.is_empty() {
        println!("✓ {}: no orphaned indices on {}", report.site, report.cluster);
        return;
    }
    println!("✓ {}: deleted {} index(es)", report.site, report.deleted.len());
    for index in &report.deleted {
        println!("  - {}", index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_site(config: &Config, cluster: &str, version: &str) {
        std::fs::create_dir_all(config.paths.site_dir("shop")).unwrap();
        std::fs::write(
            config.paths.site_file("shop"),
            format!(
                "data_source = \"main\"\nindex_name = \"shop\"\n\
                 es_cluster = \"{}\"\nes_version = \"{}\"\n",
                cluster, version
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_clean_deletes_orphans() {
        let tmp = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let config = Config::default().with_base_dir(tmp.path());
        write_site(&config, &server.uri(), "5.6.16");

        Mock::given(method("GET"))
            .and(path("/_alias"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "shop_20240101000000": {"aliases": {}},
                "shop_20240102000000": {"aliases": {"shop": {}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/shop_20240101000000"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let report = cmd_clean(&config, "shop").await.unwrap();
        assert_eq!(report.deleted, vec!["shop_20240101000000".to_string()]);
    }

    #[tokio::test]
    async fn test_clean_requires_cluster() {
        let tmp = TempDir::new().unwrap();
        let config = Config::default().with_base_dir(tmp.path());
        write_site(&config, "", "7.10.0");
        let err = cmd_clean(&config, "shop").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
