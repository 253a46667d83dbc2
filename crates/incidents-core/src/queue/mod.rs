//! Durable, per-entity FIFO queue of pending sync operations.
//!
//! Operations are rows in `sync_operations`, ordered by `seq`. Within one
//! entity the lowest `seq` is the head and is the only operation eligible for
//! dispatch. Enqueueing coalesces against the queued (not in-flight) tail of
//! the same entity:
//!
//! - Update after a queued Create/Update replaces that operation's payload.
//! - Delete cancels queued Create/Update. If the cancelled Create never
//!   reached the network, nothing is left in the queue.
//! - Upload is deduplicated per attachment.

use std::collections::HashSet;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::db::rows::{parse_operation, OPERATION_COLUMNS};
use crate::db::SharedDatabase;
use crate::error::{Error, Result};
use crate::models::{
    ErrorKind, OperationId, OperationKind, OperationTarget, ReportFields, ReportId, SyncOperation,
};
use crate::util::now_millis;

/// An operation to append to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub target: OperationTarget,
    pub kind: OperationKind,
    pub payload: Option<ReportFields>,
    pub base_revision: i64,
}

impl NewOperation {
    #[must_use]
    pub fn create(report: ReportId, fields: ReportFields, revision: i64) -> Self {
        Self {
            target: OperationTarget::Report(report),
            kind: OperationKind::Create,
            payload: Some(fields),
            base_revision: revision,
        }
    }

    #[must_use]
    pub fn update(report: ReportId, fields: ReportFields, revision: i64) -> Self {
        Self {
            target: OperationTarget::Report(report),
            kind: OperationKind::Update,
            payload: Some(fields),
            base_revision: revision,
        }
    }

    #[must_use]
    pub const fn delete(report: ReportId, revision: i64) -> Self {
        Self {
            target: OperationTarget::Report(report),
            kind: OperationKind::Delete,
            payload: None,
            base_revision: revision,
        }
    }

    #[must_use]
    pub const fn upload(target: OperationTarget) -> Self {
        Self {
            target,
            kind: OperationKind::Upload,
            payload: None,
            base_revision: 0,
        }
    }
}

/// What `enqueue` did with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended as a new queue entry
    Appended(OperationId),
    /// Folded into an existing queued entry
    Coalesced(OperationId),
    /// A delete cancelled a create that never reached the server; queue holds nothing
    Cancelled,
}

/// Handle to the durable sync queue.
#[derive(Clone)]
pub struct SyncQueue {
    db: SharedDatabase,
}

impl SyncQueue {
    pub const fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Enqueue an operation in its own transaction.
    pub async fn enqueue(&self, op: NewOperation) -> Result<EnqueueOutcome> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let outcome = enqueue_in(&tx, op, now_millis())?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Claim up to `max` dispatchable operations, oldest-eligible first.
    ///
    /// Only the head of each entity is considered, and at most one operation
    /// touches a given report: an upload and an edit of the same report are
    /// never claimed together, nor while either is in flight. Reports parked
    /// in `Conflict` or `Failed` are skipped. Claimed operations are marked
    /// in flight until acked, rescheduled, released or removed.
    pub async fn next_batch(&self, max: usize) -> Result<Vec<SyncOperation>> {
        self.next_batch_at(max, now_millis()).await
    }

    pub(crate) async fn next_batch_at(&self, max: usize, now: i64) -> Result<Vec<SyncOperation>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM sync_operations o
                 WHERE o.seq = (SELECT MIN(seq) FROM sync_operations WHERE entity_id = o.entity_id)
                   AND o.inflight = 0
                   AND o.next_eligible_at <= ?1
                   AND NOT EXISTS (
                        SELECT 1 FROM sync_operations busy
                        WHERE busy.report_id = o.report_id AND busy.inflight = 1)
                   AND (o.kind = 'upload' OR NOT EXISTS (
                        SELECT 1 FROM reports r
                        WHERE r.id = o.report_id AND r.sync_status IN ('conflict', 'failed')))
                   AND (o.kind != 'upload' OR EXISTS (
                        SELECT 1 FROM reports r
                        WHERE r.id = o.report_id AND r.remote_id IS NOT NULL AND r.is_deleted = 0))
                 ORDER BY o.next_eligible_at, o.seq"
            ))?;
            let ops = stmt
                .query_map(params![now], parse_operation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ops
        };

        let mut reports = HashSet::new();
        let batch: Vec<SyncOperation> = candidates
            .into_iter()
            .filter(|op| reports.insert(op.report_id()))
            .take(max)
            .collect();
        for op in &batch {
            tx.execute(
                "UPDATE sync_operations SET inflight = 1 WHERE id = ?",
                params![op.id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(batch)
    }

    /// Remove an operation after confirmed success.
    pub async fn ack(&self, op_id: &OperationId) -> Result<()> {
        let db = self.db.lock().await;
        ack_in(db.connection(), op_id)
    }

    /// Record a failed attempt and push the operation back by `delay`.
    ///
    /// Returns the new attempt count.
    pub async fn reschedule(
        &self,
        op_id: &OperationId,
        delay: Duration,
        error_kind: ErrorKind,
        message: &str,
    ) -> Result<u32> {
        let db = self.db.lock().await;
        reschedule_in(db.connection(), op_id, delay, error_kind, message, true)
    }

    /// Push the operation back without counting an attempt.
    pub async fn postpone(
        &self,
        op_id: &OperationId,
        delay: Duration,
        error_kind: ErrorKind,
        message: &str,
    ) -> Result<()> {
        let db = self.db.lock().await;
        reschedule_in(db.connection(), op_id, delay, error_kind, message, false)?;
        Ok(())
    }

    /// Return a claimed operation to the queue unchanged.
    pub async fn release(&self, op_id: &OperationId) -> Result<()> {
        let db = self.db.lock().await;
        db.connection().execute(
            "UPDATE sync_operations SET inflight = 0 WHERE id = ?",
            params![op_id.as_str()],
        )?;
        Ok(())
    }

    pub async fn get(&self, op_id: &OperationId) -> Result<Option<SyncOperation>> {
        let db = self.db.lock().await;
        get_in(db.connection(), op_id)
    }

    /// All queued operations in queue order.
    pub async fn list(&self) -> Result<Vec<SyncOperation>> {
        let db = self.db.lock().await;
        let mut stmt = db.connection().prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM sync_operations ORDER BY seq"
        ))?;
        let ops = stmt
            .query_map([], parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ops)
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 =
            db.connection()
                .query_row("SELECT COUNT(*) FROM sync_operations", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

pub(crate) fn get_in(conn: &Connection, op_id: &OperationId) -> Result<Option<SyncOperation>> {
    let op = conn
        .query_row(
            &format!("SELECT {OPERATION_COLUMNS} FROM sync_operations WHERE id = ?"),
            params![op_id.as_str()],
            parse_operation,
        )
        .optional()?;
    Ok(op)
}

pub(crate) fn ack_in(conn: &Connection, op_id: &OperationId) -> Result<()> {
    let rows = conn.execute(
        "DELETE FROM sync_operations WHERE id = ?",
        params![op_id.as_str()],
    )?;
    if rows == 0 {
        return Err(Error::NotFound(format!("operation {op_id}")));
    }
    Ok(())
}

fn reschedule_in(
    conn: &Connection,
    op_id: &OperationId,
    delay: Duration,
    error_kind: ErrorKind,
    message: &str,
    count_attempt: bool,
) -> Result<u32> {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    let next = now_millis().saturating_add(delay_ms);
    let rows = conn.execute(
        "UPDATE sync_operations
         SET attempts = attempts + ?, next_eligible_at = ?, last_error_kind = ?,
             last_error = ?, inflight = 0
         WHERE id = ?",
        params![
            i32::from(count_attempt),
            next,
            error_kind.as_str(),
            message,
            op_id.as_str()
        ],
    )?;
    if rows == 0 {
        return Err(Error::NotFound(format!("operation {op_id}")));
    }
    let attempts = conn.query_row(
        "SELECT attempts FROM sync_operations WHERE id = ?",
        params![op_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(attempts)
}

/// Queued (not in-flight) operations of one entity, oldest first.
fn queued_for_entity(conn: &Connection, entity_id: &str) -> Result<Vec<SyncOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM sync_operations
         WHERE entity_id = ? AND inflight = 0 ORDER BY seq"
    ))?;
    let ops = stmt
        .query_map(params![entity_id], parse_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

fn has_inflight(conn: &Connection, entity_id: &str) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_operations WHERE entity_id = ? AND inflight = 1)",
        params![entity_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Whether any operation (queued or in flight) remains for the report itself.
pub(crate) fn has_pending_for_report(conn: &Connection, report_id: &ReportId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sync_operations WHERE entity_id = ?1 AND kind != 'upload')",
        params![report_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Create and Update operations of a report, in queue order.
pub(crate) fn queued_edits_for_report(
    conn: &Connection,
    report_id: &ReportId,
) -> Result<Vec<SyncOperation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OPERATION_COLUMNS} FROM sync_operations
         WHERE entity_id = ? AND kind IN ('create', 'update') ORDER BY seq"
    ))?;
    let ops = stmt
        .query_map(params![report_id.as_str()], parse_operation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ops)
}

/// Drop queued attachment uploads belonging to a report.
pub(crate) fn remove_uploads_for_report(conn: &Connection, report_id: &ReportId) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM sync_operations WHERE report_id = ? AND kind = 'upload' AND inflight = 0",
        params![report_id.as_str()],
    )?;
    Ok(rows)
}

/// Drop every operation of the report itself (used when adopting the remote side).
pub(crate) fn remove_for_report(conn: &Connection, report_id: &ReportId) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM sync_operations WHERE entity_id = ? AND kind != 'upload'",
        params![report_id.as_str()],
    )?;
    Ok(rows)
}

/// Overwrite the payload of a queued operation.
pub(crate) fn replace_payload_in(
    conn: &Connection,
    op_id: &OperationId,
    kind: OperationKind,
    payload: Option<&ReportFields>,
    base_revision: i64,
) -> Result<()> {
    let payload = payload.map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE sync_operations SET kind = ?, payload = ?, base_revision = ? WHERE id = ?",
        params![kind.as_str(), payload, base_revision, op_id.as_str()],
    )?;
    Ok(())
}

/// Reset attempts and eligibility so the operation is dispatched on the next pass.
pub(crate) fn reset_backoff_in(conn: &Connection, op_id: &OperationId) -> Result<()> {
    conn.execute(
        "UPDATE sync_operations
         SET attempts = 0, next_eligible_at = 0, last_error_kind = NULL, last_error = NULL
         WHERE id = ?",
        params![op_id.as_str()],
    )?;
    Ok(())
}

fn append_in(conn: &Connection, op: &NewOperation, now: i64) -> Result<OperationId> {
    let id = OperationId::new();
    let payload = op.payload.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO sync_operations
            (id, entity_id, report_id, kind, payload, base_revision, attempts, next_eligible_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
        params![
            id.as_str(),
            op.target.entity_key(),
            op.target.report_id().as_str(),
            op.kind.as_str(),
            payload,
            op.base_revision,
            now,
            now,
        ],
    )?;
    Ok(id)
}

/// Enqueue `op` on `conn`, applying the coalescing rules.
///
/// Callers pass a `Transaction` so the enqueue commits or rolls back together
/// with the mutation that produced it.
pub(crate) fn enqueue_in(conn: &Connection, op: NewOperation, now: i64) -> Result<EnqueueOutcome> {
    let entity_id = op.target.entity_key();
    let queued = queued_for_entity(conn, &entity_id)?;

    let outcome = match op.kind {
        OperationKind::Create => {
            if queued.iter().any(|queued| queued.kind == OperationKind::Create) {
                return Err(Error::Conflict(format!(
                    "create already queued for {entity_id}"
                )));
            }
            EnqueueOutcome::Appended(append_in(conn, &op, now)?)
        }
        OperationKind::Update => match queued.last() {
            Some(tail) if matches!(tail.kind, OperationKind::Create | OperationKind::Update) => {
                replace_payload_in(
                    conn,
                    &tail.id,
                    tail.kind,
                    op.payload.as_ref(),
                    op.base_revision,
                )?;
                EnqueueOutcome::Coalesced(tail.id)
            }
            Some(tail) if tail.kind == OperationKind::Delete => {
                return Err(Error::Conflict(format!(
                    "cannot update {entity_id} after delete"
                )));
            }
            _ => EnqueueOutcome::Appended(append_in(conn, &op, now)?),
        },
        OperationKind::Delete => {
            if let Some(existing) = queued.iter().find(|q| q.kind == OperationKind::Delete) {
                return Ok(EnqueueOutcome::Coalesced(existing.id));
            }
            let mut cancelled_unsent_create = false;
            for queued in &queued {
                if matches!(queued.kind, OperationKind::Create | OperationKind::Update) {
                    if queued.kind == OperationKind::Create && queued.attempts == 0 {
                        cancelled_unsent_create = true;
                    }
                    ack_in(conn, &queued.id)?;
                }
            }
            if cancelled_unsent_create && !has_inflight(conn, &entity_id)? {
                EnqueueOutcome::Cancelled
            } else {
                EnqueueOutcome::Appended(append_in(conn, &op, now)?)
            }
        }
        OperationKind::Upload => {
            if let Some(existing) = queued.first() {
                EnqueueOutcome::Coalesced(existing.id)
            } else {
                EnqueueOutcome::Appended(append_in(conn, &op, now)?)
            }
        }
    };

    tracing::debug!(entity = %entity_id, kind = %op.kind, ?outcome, "Enqueued sync operation");
    Ok(outcome)
}
