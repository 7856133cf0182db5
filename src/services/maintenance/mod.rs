//! Maintenance: rule evaluation, exclusions and deletions

pub mod bulk;
pub mod criteria;
pub mod deletion;
pub mod evaluator;
pub mod exclusions;

pub use bulk::{BulkDeleteOrchestrator, BulkDeleteRequest, BulkDeleteResult, BulkEvent};
pub use criteria::RuleParams;
pub use deletion::DeletionPipeline;
pub use evaluator::RuleEvaluator;
pub use exclusions::ExclusionService;

use std::collections::HashSet;

use crate::error::{MaintenanceError, MaintenanceResult};

/// Upper bound for ID lists in bulk requests
pub const MAX_BULK_IDS: usize = 500;

/// Validate an ID list from a bulk request.
///
/// Rejects empty lists, lists longer than `max` and non-positive IDs. Duplicates are
/// either an error or silently dropped, depending on `allow_duplicates`. Returns
/// the IDs in input order.
pub fn validate_id_list(
    field: &str,
    ids: &[i64],
    max: usize,
    allow_duplicates: bool,
) -> MaintenanceResult<Vec<i64>> {
    if ids.is_empty() {
        return Err(MaintenanceError::Validation(format!("{} must not be empty", field)));
    }
    if ids.len() > max {
        return Err(MaintenanceError::Validation(format!(
            "{} accepts at most {} ids, got {}",
            field,
            max,
            ids.len()
        )));
    }
    if let Some(bad) = ids.iter().find(|id| **id <= 0) {
        return Err(MaintenanceError::Validation(format!(
            "{} contains invalid id {}",
            field, bad
        )));
    }

    let mut seen = HashSet::with_capacity(ids.len());
    let mut unique = Vec::with_capacity(ids.len());
    for id in ids {
        if seen.insert(*id) {
            unique.push(*id);
        } else if !allow_duplicates {
            return Err(MaintenanceError::Validation(format!(
                "{} contains duplicate id {}",
                field, id
            )));
        }
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_validate_id_list() {
        assert_eq!(validate_id_list("ids", &[3, 1, 3], 10, true).unwrap(), vec![3, 1]);
        assert_matches!(
            validate_id_list("ids", &[3, 1, 3], 10, false),
            Err(MaintenanceError::Validation(_))
        );
        assert_matches!(validate_id_list("ids", &[], 10, true), Err(MaintenanceError::Validation(_)));
        assert_matches!(validate_id_list("ids", &[1, 0], 10, true), Err(MaintenanceError::Validation(_)));
        assert_matches!(validate_id_list("ids", &[1, 2, 3], 2, true), Err(MaintenanceError::Validation(_)));
    }
}
