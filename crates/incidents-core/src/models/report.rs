//! Incident report model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::now_millis;

use super::attachment::AttachmentId;
use super::conflict::ReportConflict;

/// A unique identifier for a report, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReportId(Uuid);

impl ReportId {
    /// Create a new unique report ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ReportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReportId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Client-generated token the server uses to deduplicate retried creates.
///
/// Shaped as a `PocketBase` record id: 15 lowercase alphanumeric characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    pub const LENGTH: usize = 15;

    #[must_use]
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw.chars().take(Self::LENGTH).collect())
    }

    pub fn parse(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = value.len() == Self::LENGTH
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase());
        if !valid {
            return Err(Error::InvalidInput(format!(
                "idempotency token must be {} lowercase alphanumeric characters",
                Self::LENGTH
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Local sync state of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Draft,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Synced,
    Conflict,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingCreate => "pending_create",
            Self::PendingUpdate => "pending_update",
            Self::PendingDelete => "pending_delete",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Whether a report with this status may exist without a remote id.
    #[must_use]
    pub const fn allows_missing_remote_id(self) -> bool {
        matches!(self, Self::Draft | Self::PendingCreate | Self::Failed)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "pending_create" => Ok(Self::PendingCreate),
            "pending_update" => Ok(Self::PendingUpdate),
            "pending_delete" => Ok(Self::PendingDelete),
            "synced" => Ok(Self::Synced),
            "conflict" => Ok(Self::Conflict),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// Responder-facing workflow status of an incident.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    Pending,
    Ongoing,
    Resolved,
}

impl IncidentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ongoing => "ongoing",
            Self::Resolved => "resolved",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "ongoing" | "in progress" | "in_progress" => Ok(Self::Ongoing),
            "resolved" => Ok(Self::Resolved),
            other => Err(Error::InvalidInput(format!(
                "unknown incident status: {other}"
            ))),
        }
    }
}

/// Validated geographic coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if latitude.is_nan() || longitude.is_nan() {
            return Err(Error::InvalidInput("Coordinates cannot be NaN".into()));
        }
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::InvalidInput(format!(
                "Latitude must be between -90 and 90, got {latitude}"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::InvalidInput(format!(
                "Longitude must be between -180 and 180, got {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// A mergeable report field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportField {
    Title,
    Description,
    IncidentType,
    Status,
    Location,
    OccurredAt,
}

impl ReportField {
    pub const ALL: [Self; 6] = [
        Self::Title,
        Self::Description,
        Self::IncidentType,
        Self::Status,
        Self::Location,
        Self::OccurredAt,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::IncidentType => "incident_type",
            Self::Status => "status",
            Self::Location => "location",
            Self::OccurredAt => "occurred_at",
        }
    }
}

impl fmt::Display for ReportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-editable content of a report; also the payload sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFields {
    pub title: String,
    pub description: String,
    pub incident_type: String,
    pub status: IncidentStatus,
    pub location: Option<Location>,
    /// When the incident happened (Unix ms)
    pub occurred_at: i64,
}

impl ReportFields {
    fn field_eq(&self, other: &Self, field: ReportField) -> bool {
        match field {
            ReportField::Title => self.title == other.title,
            ReportField::Description => self.description == other.description,
            ReportField::IncidentType => self.incident_type == other.incident_type,
            ReportField::Status => self.status == other.status,
            ReportField::Location => self.location == other.location,
            ReportField::OccurredAt => self.occurred_at == other.occurred_at,
        }
    }

    /// Fields whose values differ between `self` and `other`.
    #[must_use]
    pub fn changed_fields(&self, other: &Self) -> BTreeSet<ReportField> {
        ReportField::ALL
            .into_iter()
            .filter(|field| !self.field_eq(other, *field))
            .collect()
    }

    /// Copy a single field's value from `source`.
    pub fn take_field(&mut self, source: &Self, field: ReportField) {
        match field {
            ReportField::Title => self.title.clone_from(&source.title),
            ReportField::Description => self.description.clone_from(&source.description),
            ReportField::IncidentType => self.incident_type.clone_from(&source.incident_type),
            ReportField::Status => self.status = source.status,
            ReportField::Location => self.location = source.location,
            ReportField::OccurredAt => self.occurred_at = source.occurred_at,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Report title cannot be empty".to_string(),
            ));
        }
        if self.description.len() > ReportDraft::MAX_DESCRIPTION_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Description exceeds {} characters",
                ReportDraft::MAX_DESCRIPTION_LENGTH
            )));
        }
        Ok(())
    }
}

/// Input for creating a report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportDraft {
    pub title: String,
    pub description: String,
    pub incident_type: String,
    pub status: IncidentStatus,
    pub location: Option<Location>,
    /// Defaults to creation time when unset
    pub occurred_at: Option<i64>,
}

impl ReportDraft {
    const MAX_DESCRIPTION_LENGTH: usize = 4096;

    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_type(mut self, incident_type: impl Into<String>) -> Self {
        self.incident_type = incident_type.into();
        self
    }

    #[must_use]
    pub const fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: IncidentStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn with_occurred_at(mut self, occurred_at: i64) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Normalize into report fields, validating required values.
    pub fn into_fields(self, now: i64) -> Result<ReportFields> {
        let fields = ReportFields {
            title: self.title.trim().to_string(),
            description: self.description.trim().to_string(),
            incident_type: self.incident_type.trim().to_string(),
            status: self.status,
            location: self.location,
            occurred_at: self.occurred_at.unwrap_or(now),
        };
        fields.validate()?;
        Ok(fields)
    }
}

/// Partial update of a report. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub incident_type: Option<String>,
    pub status: Option<IncidentStatus>,
    /// `Some(None)` clears the location
    pub location: Option<Option<Location>>,
    pub occurred_at: Option<i64>,
}

impl ReportPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.incident_type.is_none()
            && self.status.is_none()
            && self.location.is_none()
            && self.occurred_at.is_none()
    }

    /// Apply this patch to `fields`, validating the result.
    pub fn apply(&self, fields: &mut ReportFields) -> Result<()> {
        if let Some(title) = &self.title {
            fields.title = title.trim().to_string();
        }
        if let Some(description) = &self.description {
            fields.description = description.trim().to_string();
        }
        if let Some(incident_type) = &self.incident_type {
            fields.incident_type = incident_type.trim().to_string();
        }
        if let Some(status) = self.status {
            fields.status = status;
        }
        if let Some(location) = self.location {
            fields.location = location;
        }
        if let Some(occurred_at) = self.occurred_at {
            fields.occurred_at = occurred_at;
        }
        fields.validate()
    }
}

/// An incident report as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReport {
    pub id: ReportId,
    /// Server record id, assigned once the create is acknowledged
    pub remote_id: Option<String>,
    pub idempotency_token: IdempotencyToken,
    pub fields: ReportFields,
    pub attachments: Vec<AttachmentId>,
    pub sync_status: SyncStatus,
    /// Monotonic local edit counter
    pub revision: i64,
    /// Last known server version token (opaque)
    pub remote_revision: Option<String>,
    /// Field values as of the last acknowledged sync; the merge base
    pub synced_fields: Option<ReportFields>,
    /// Both sides of an unresolved conflict
    pub conflict: Option<ReportConflict>,
    pub last_error: Option<String>,
    /// Tombstone kept until the remote delete is acknowledged
    pub is_deleted: bool,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last local update timestamp (Unix ms)
    pub updated_at: i64,
}

impl IncidentReport {
    pub(crate) fn new(fields: ReportFields, attachments: Vec<AttachmentId>) -> Self {
        let now = now_millis();
        Self {
            id: ReportId::new(),
            remote_id: None,
            idempotency_token: IdempotencyToken::generate(),
            fields,
            attachments,
            sync_status: SyncStatus::Draft,
            revision: 1,
            remote_revision: None,
            synced_fields: None,
            conflict: None,
            last_error: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the remote-id / sync-status invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.remote_id.is_some() || self.sync_status.allows_missing_remote_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> ReportFields {
        ReportDraft::new("Smoke on 5th street")
            .with_description("grey smoke from a warehouse")
            .with_type("Fire")
            .into_fields(1_000)
            .unwrap()
    }

    #[test]
    fn test_report_id_parse() {
        let id = ReportId::new();
        let parsed: ReportId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_idempotency_token_shape() {
        let token = IdempotencyToken::generate();
        assert_eq!(token.as_str().len(), IdempotencyToken::LENGTH);
        assert!(IdempotencyToken::parse(token.as_str()).is_ok());
        assert!(IdempotencyToken::parse("UPPERCASE123456").is_err());
        assert!(IdempotencyToken::parse("short").is_err());
    }

    #[test]
    fn test_sync_status_roundtrips_through_str() {
        for status in [
            SyncStatus::Draft,
            SyncStatus::PendingCreate,
            SyncStatus::PendingUpdate,
            SyncStatus::PendingDelete,
            SyncStatus::Synced,
            SyncStatus::Conflict,
            SyncStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_draft_requires_title() {
        assert!(ReportDraft::new("   ").into_fields(0).is_err());
    }

    #[test]
    fn test_draft_defaults_occurred_at_to_now() {
        let fields = ReportDraft::new("x").into_fields(42).unwrap();
        assert_eq!(fields.occurred_at, 42);
        assert_eq!(fields.status, IncidentStatus::Pending);
    }

    #[test]
    fn test_location_validation() {
        assert!(Location::new(14.6, 121.0).is_ok());
        assert!(Location::new(91.0, 0.0).is_err());
        assert!(Location::new(0.0, -181.0).is_err());
        assert!(Location::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_changed_fields() {
        let base = fields();
        let mut edited = base.clone();
        edited.title = "Fire on 5th street".to_string();
        edited.status = IncidentStatus::Ongoing;

        let changed = base.changed_fields(&edited);
        assert_eq!(
            changed.into_iter().collect::<Vec<_>>(),
            vec![ReportField::Title, ReportField::Status]
        );
    }

    #[test]
    fn test_patch_applies_only_given_fields() {
        let mut target = fields();
        let patch = ReportPatch {
            description: Some("  flames visible ".to_string()),
            location: Some(Some(Location::new(1.0, 2.0).unwrap())),
            ..ReportPatch::default()
        };

        patch.apply(&mut target).unwrap();
        assert_eq!(target.title, "Smoke on 5th street");
        assert_eq!(target.description, "flames visible");
        assert!(target.location.is_some());
        assert!(ReportPatch::default().is_empty());
    }

    #[test]
    fn test_new_report_is_draft_without_remote_id() {
        let report = IncidentReport::new(fields(), Vec::new());
        assert_eq!(report.sync_status, SyncStatus::Draft);
        assert!(report.remote_id.is_none());
        assert!(report.is_consistent());
    }
}
