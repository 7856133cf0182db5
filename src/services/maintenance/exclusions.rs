//! Exclusion ledger
//!
//! An exclusion protects a library item from one rule (`Some(rule_id)`) or from
//! every rule (`None`). Creating one drops the matching candidate rows at once.

use tracing::info;

use super::{MAX_BULK_IDS, validate_id_list};
use crate::db::sqlite_helpers::Page;
use crate::db::{Database, PaginatedExclusions};
use crate::error::{MaintenanceError, MaintenanceResult};

#[derive(Clone)]
pub struct ExclusionService {
    db: Database,
}

impl ExclusionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn ensure_rule(&self, rule_id: Option<i64>) -> MaintenanceResult<()> {
        if let Some(rule_id) = rule_id {
            if self.db.rules().get(rule_id).await?.is_none() {
                return Err(MaintenanceError::not_found("rule", rule_id));
            }
        }
        Ok(())
    }

    /// Exclude items. Returns the number of new exclusions; existing ones are kept.
    pub async fn create(
        &self,
        rule_id: Option<i64>,
        item_ids: &[i64],
        excluded_by: &str,
    ) -> MaintenanceResult<u64> {
        self.ensure_rule(rule_id).await?;
        let ids = validate_id_list("library_item_ids", item_ids, MAX_BULK_IDS, true)?;

        let existing = self.db.library_items().existing_ids(&ids).await?;
        if existing.len() != ids.len() {
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !existing.contains(*id))
                .map(|id| id.to_string())
                .collect();
            return Err(MaintenanceError::Validation(format!(
                "unknown library items: {}",
                missing.join(", ")
            )));
        }

        let created = self
            .db
            .exclusions()
            .create_bulk(rule_id, &ids, excluded_by)
            .await?;
        info!(?rule_id, requested = ids.len(), created, excluded_by, "Exclusions created");
        Ok(created)
    }

    pub async fn list(
        &self,
        rule_id: Option<i64>,
        page: Page,
        search: Option<&str>,
    ) -> MaintenanceResult<PaginatedExclusions> {
        self.ensure_rule(rule_id).await?;
        Ok(self.db.exclusions().list(rule_id, page, search).await?)
    }

    /// Remove one exclusion. The item becomes a candidate again at the next refresh.
    pub async fn remove(&self, rule_id: Option<i64>, item_id: i64) -> MaintenanceResult<()> {
        self.ensure_rule(rule_id).await?;
        if !self.db.exclusions().delete(rule_id, item_id).await? {
            return Err(MaintenanceError::not_found("exclusion", item_id));
        }
        info!(?rule_id, item_id, "Exclusion removed");
        Ok(())
    }

    pub async fn remove_bulk(&self, rule_id: Option<i64>, item_ids: &[i64]) -> MaintenanceResult<u64> {
        self.ensure_rule(rule_id).await?;
        let ids = validate_id_list("library_item_ids", item_ids, MAX_BULK_IDS, true)?;
        let removed = self.db.exclusions().delete_bulk(rule_id, &ids).await?;
        info!(?rule_id, removed, "Exclusions removed");
        Ok(removed)
    }
}
