//! Removal of physical indices no alias points at

use super::alias::is_system_index;
use super::sink::{AliasTable, IndexSink};
use crate::error::Result;
use tracing::info;

/// Non-system indices without any alias
pub fn orphaned_indices(table: &AliasTable) -> Vec<String> {
    table
        .iter()
        .filter(|(index, aliases)| {
            if is_system_index(index) {
                return false;
            }
            if !aliases.is_empty() {
                info!("{} has alias: {}", index, aliases.join(", "));
            }
            aliases.is_empty()
        })
        .map(|(index, _)| index.clone())
        .collect()
}

/// Delete every orphaned index in one request; returns the deleted names
pub async fn clean_orphans(sink: &dyn IndexSink) -> Result<Vec<String>> {
    let table = sink.list_aliases().await?;
    let orphans = orphaned_indices(&table);
    if orphans.is_empty() {
        info!("no index will delete");
        return Ok(orphans);
    }
    info!("deleted no alias index: {}", orphans.join(", "));
    sink.delete_indices(&orphans).await?;
    Ok(orphans)
}
