//! Duplicate pay periods.
//!
//! Payslips that claim the same employer and period bounds form a conflict
//! group. Resolving a group keeps one member in totals and flags the rest.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::db::{self, PayslipTotals, Pool};
use crate::model::Payslip;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("payslip {0} is not part of the conflict group")]
    NotInGroup(String),
    #[error("failed to update payslips: {}", .failed.join(", "))]
    Partial { failed: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ConflictKey {
    pub employer_name: String,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
}

impl ConflictKey {
    /// Payslips without an employer or either period bound are never grouped.
    pub fn of(payslip: &Payslip) -> Option<Self> {
        let employer = payslip.employer_name.as_deref().map(str::trim)?;
        if employer.is_empty() {
            return None;
        }
        Some(Self {
            employer_name: employer.to_string(),
            period_start: payslip.period_start?,
            period_end: payslip.period_end?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictGroup {
    pub key: ConflictKey,
    pub members: Vec<Payslip>,
}

impl ConflictGroup {
    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|p| p.id.clone()).collect()
    }
}

/// Groups with more than one member, ordered by key. Conflicted payslips are
/// included so an earlier resolution can be revisited.
pub fn group_conflicts(payslips: &[Payslip]) -> Vec<ConflictGroup> {
    let mut groups: BTreeMap<ConflictKey, Vec<Payslip>> = BTreeMap::new();
    for payslip in payslips {
        if let Some(key) = ConflictKey::of(payslip) {
            groups.entry(key).or_default().push(payslip.clone());
        }
    }
    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(key, members)| ConflictGroup { key, members })
        .collect()
}

pub fn included_in_totals(payslip: &Payslip) -> bool {
    !payslip.conflict
}

/// Sums over every payslip that is not flagged as a conflict.
#[instrument(skip_all)]
pub async fn aggregate_totals(pool: &Pool, user_id: &str) -> anyhow::Result<PayslipTotals> {
    db::sum_included_payslips(pool, user_id).await
}

#[instrument(skip_all)]
pub async fn find_conflicts(pool: &Pool, user_id: &str) -> anyhow::Result<Vec<ConflictGroup>> {
    let payslips = db::list_payslips(pool, user_id).await?;
    Ok(group_conflicts(&payslips))
}

/// Keep `selected_id` and flag every other member of `group`.
///
/// Updates are independent; on partial failure the group is left mixed and the
/// caller should re-query and resolve again.
#[instrument(skip_all, fields(selected_id = %selected_id))]
pub async fn resolve_conflict_group(
    pool: &Pool,
    selected_id: &str,
    group: &[String],
) -> Result<(), ConflictError> {
    if !group.iter().any(|id| id == selected_id) {
        return Err(ConflictError::NotInGroup(selected_id.to_string()));
    }
    let updates = group.iter().map(|id| async move {
        let res = db::set_payslip_conflict(pool, id, id != selected_id).await;
        (id, res)
    });
    let failed: Vec<String> = join_all(updates)
        .await
        .into_iter()
        .filter_map(|(id, res)| match res {
            Ok(()) => None,
            Err(err) => {
                warn!(?err, payslip_id = %id, "conflict flag update failed");
                Some(id.clone())
            }
        })
        .collect();
    if !failed.is_empty() {
        return Err(ConflictError::Partial { failed });
    }
    info!(members = group.len(), "conflict group resolved");
    Ok(())
}
