//! Alias cut-over from the previous physical index to a new one

use super::sink::IndexSink;
use crate::error::{Error, Result};
use serde::Serialize;
use tracing::{info, warn};

/// What [`swap_alias`] did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AliasChange {
    /// The alias did not exist and now points at the new index
    Created { index: String },
    /// The alias moved from `from` to `to` in one request
    Swapped { from: Vec<String>, to: String },
}

/// System indices (leading `.`) are never alias candidates
pub fn is_system_index(name: &str) -> bool {
    name.starts_with('.')
}

/// Point `alias` at `new_index`.
///
/// A missing alias is simply created. Otherwise the currently bound
/// non-system index is resolved and removed in the same atomic update that
/// adds the new one. Old indices are never deleted here.
pub async fn swap_alias(sink: &dyn IndexSink, alias: &str, new_index: &str) -> Result<AliasChange> {
    if !sink.alias_exists(alias).await? {
        info!("alias not found, put alias {} -> {}", alias, new_index);
        sink.alias_put(new_index, alias).await?;
        return Ok(AliasChange::Created {
            index: new_index.to_string(),
        });
    }

    info!("alias has found");
    let mut old: Vec<String> = sink
        .alias_get(alias)
        .await?
        .into_iter()
        .filter(|index| !is_system_index(index) && index != new_index)
        .collect();
    if old.is_empty() {
        return Err(Error::AliasProtocol("empty old index name".to_string()));
    }
    old.sort();
    if old.len() > 1 {
        warn!("alias {} is bound to {} indices: {}", alias, old.len(), old.join(", "));
    }

    sink.alias_swap(&old, new_index, alias).await?;
    info!("alias {} moved {} -> {}", alias, old.join(","), new_index);
    Ok(AliasChange::Swapped {
        from: old,
        to: new_index.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{CurrentSink, EsClient, LegacySink};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn current(server: &MockServer) -> CurrentSink {
        CurrentSink::new(EsClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap(), 0)
    }

    #[tokio::test]
    async fn test_cold_start_creates_alias() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/shop_20250101000000/_alias/shop"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let change = swap_alias(&current(&server), "shop", "shop_20250101000000")
            .await
            .unwrap();
        assert_eq!(
            change,
            AliasChange::Created {
                index: "shop_20250101000000".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_warm_swap_is_one_atomic_request() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "shop_old": {"aliases": {"shop": {}}},
                ".security": {"aliases": {"shop": {}}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .and(body_json(json!({"actions": [
                {"remove": {"index": "shop_old", "alias": "shop"}},
                {"add": {"index": "shop_new", "alias": "shop"}}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let change = swap_alias(&current(&server), "shop", "shop_new").await.unwrap();
        assert_eq!(
            change,
            AliasChange::Swapped {
                from: vec!["shop_old".to_string()],
                to: "shop_new".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_alias_on_system_index_only_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_alias/shop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({".kibana": {"aliases": {"shop": {}}}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = swap_alias(&current(&server), "shop", "shop_new").await.unwrap_err();
        assert!(matches!(err, Error::AliasProtocol(msg) if msg == "empty old index name"));
    }

    #[tokio::test]
    async fn test_existence_check_failure_aborts() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = swap_alias(&current(&server), "shop", "shop_new").await.unwrap_err();
        assert!(matches!(err, Error::IndexEngine(_)));
    }

    #[tokio::test]
    async fn test_legacy_warm_swap() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/_alias/shop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_alias/shop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"shop_1": {"aliases": {"shop": {}}}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = tempfile::TempDir::new().unwrap();
        let sink = LegacySink::new(
            EsClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap(),
            "_doc",
            tmp.path().to_path_buf(),
        );
        let change = swap_alias(&sink, "shop", "shop_2").await.unwrap();
        assert!(matches!(change, AliasChange::Swapped { to, .. } if to == "shop_2"));
    }
}
