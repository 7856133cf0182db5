//! Rule evaluation
//!
//! Evaluation only reads the cache. [RuleEvaluator::refresh_rule] is the one
//! writer: it converges the candidate table to what evaluation returns.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::criteria::RuleParams;
use crate::db::{Database, MaintenanceRuleRecord, UpsertCandidate};
use crate::error::MaintenanceResult;

#[derive(Clone)]
pub struct RuleEvaluator {
    db: Database,
}

impl RuleEvaluator {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Items in the rule's scope that match its criterion, excluded items removed
    pub async fn evaluate_rule(&self, rule: &MaintenanceRuleRecord) -> MaintenanceResult<Vec<UpsertCandidate>> {
        self.evaluate_rule_at(rule, Utc::now()).await
    }

    pub async fn evaluate_rule_at(
        &self,
        rule: &MaintenanceRuleRecord,
        now: DateTime<Utc>,
    ) -> MaintenanceResult<Vec<UpsertCandidate>> {
        let params = RuleParams::parse(rule.criterion, &rule.parameters.0)?;
        let excluded = self.db.exclusions().excluded_item_ids(rule.id).await?;
        let items = self.db.library_items();

        let mut candidates = Vec::new();
        for scope in rule.libraries.iter() {
            for item in items.list_for_library(scope.server_id, &scope.library_id).await? {
                if excluded.contains(&item.id) {
                    continue;
                }
                if let Some(reason) = params.matches(&item, now) {
                    candidates.push(UpsertCandidate {
                        library_item_id: item.id,
                        reason,
                    });
                }
            }
        }

        debug!(rule_id = rule.id, matched = candidates.len(), "Rule evaluated");
        Ok(candidates)
    }

    /// Converge the rule's candidates to the current matches. A disabled rule has none.
    pub async fn refresh_rule(&self, rule: &MaintenanceRuleRecord) -> MaintenanceResult<usize> {
        let now = Utc::now();
        let candidates = if rule.enabled {
            self.evaluate_rule_at(rule, now).await?
        } else {
            Vec::new()
        };
        let removed = self
            .db
            .candidates()
            .replace_for_rule(rule.id, &candidates, now)
            .await?;

        info!(
            rule_id = rule.id,
            candidates = candidates.len(),
            removed,
            "Rule candidates refreshed"
        );
        Ok(candidates.len())
    }

    /// Refresh every enabled rule scoped to a library. Returns the total candidate count.
    pub async fn refresh_library(&self, server_id: i64, library_id: &str) -> MaintenanceResult<usize> {
        let rules = self
            .db
            .rules()
            .list_enabled_for_library(server_id, library_id)
            .await?;

        let mut total = 0;
        for rule in &rules {
            total += self.refresh_rule(rule).await?;
        }
        Ok(total)
    }
}
