//! Field-level three-way merge of concurrent report edits.

use std::collections::BTreeSet;

use crate::models::{ReportField, ReportFields};

/// Result of merging a local edit with a concurrent server edit.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The edits touch different fields. `fields` holds both; `remote_changes`
    /// lists the fields taken from the server.
    Merged {
        fields: ReportFields,
        remote_changes: BTreeSet<ReportField>,
    },
    /// Both sides changed these fields to different values.
    Conflicting(Vec<ReportField>),
}

/// Merge `local` and `remote` against their common `base`.
///
/// Without a base every differing field counts as changed on both sides.
pub fn three_way(
    base: Option<&ReportFields>,
    local: &ReportFields,
    remote: &ReportFields,
) -> MergeOutcome {
    let Some(base) = base else {
        let differing = local.changed_fields(remote);
        return if differing.is_empty() {
            MergeOutcome::Merged {
                fields: local.clone(),
                remote_changes: BTreeSet::new(),
            }
        } else {
            MergeOutcome::Conflicting(differing.into_iter().collect())
        };
    };

    let local_changes = base.changed_fields(local);
    let remote_changes = base.changed_fields(remote);
    let disagreeing = local.changed_fields(remote);

    let conflicting: Vec<ReportField> = local_changes
        .intersection(&remote_changes)
        .filter(|field| disagreeing.contains(field))
        .copied()
        .collect();
    if !conflicting.is_empty() {
        return MergeOutcome::Conflicting(conflicting);
    }

    let mut fields = local.clone();
    let remote_only: BTreeSet<ReportField> = remote_changes
        .difference(&local_changes)
        .copied()
        .collect();
    for field in &remote_only {
        fields.take_field(remote, *field);
    }
    MergeOutcome::Merged {
        fields,
        remote_changes: remote_only,
    }
}
