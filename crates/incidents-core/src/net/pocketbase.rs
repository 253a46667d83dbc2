//! `PocketBase` REST client.
//!
//! Records live in one collection (`incident_reports` by default). The
//! client-generated idempotency token is used as the record id, so a retried
//! create that already landed is detected by the id clash. The record's
//! `updated` timestamp serves as the revision token.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ApiError, ApiResult, AttachmentUpload, NetworkClient};
use crate::config::ApiConfig;
use crate::models::{
    IdempotencyToken, IncidentStatus, Location, RemoteReport, ReportFields, Session,
    UploadedAttachment,
};
use crate::util::compact_text;
use crate::{Error, Result};

const IMAGE_FIELD: &str = "incident_image";

/// HTTP client for a `PocketBase` server.
#[derive(Clone)]
pub struct PocketBaseClient {
    config: ApiConfig,
    client: Client,
}

impl std::fmt::Debug for PocketBaseClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PocketBaseClient")
            .field("base_url", &self.config.base_url)
            .field("collection", &self.config.collection)
            .finish_non_exhaustive()
    }
}

impl PocketBaseClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("incidents/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|error| Error::InvalidInput(format!("Failed to build HTTP client: {error}")))?;
        Ok(Self { config, client })
    }

    pub const fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn authorized(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder
            .bearer_auth(&session.token)
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn read_record(&self, response: Response) -> ApiResult<RemoteReport> {
        let record = response
            .json::<RecordResponse>()
            .await
            .map_err(|error| ApiError::Permanent(format!("invalid record payload: {error}")))?;
        Ok(record.into_remote(&self.config))
    }

    async fn get_record(&self, session: &Session, remote_id: &str) -> ApiResult<RemoteReport> {
        let request = self.authorized(self.client.get(self.config.record_url(remote_id)), session);
        let response = self.send(request).await?;
        self.read_record(response).await
    }
}

#[async_trait]
impl NetworkClient for PocketBaseClient {
    async fn login(&self, identity: &str, password: &str) -> ApiResult<Session> {
        let request = self
            .client
            .post(self.config.auth_url())
            .header("Accept", "application/json")
            .json(&AuthRequest { identity, password });
        let response = self.send(request).await?;
        let payload = response
            .json::<AuthResponse>()
            .await
            .map_err(|error| ApiError::Permanent(format!("invalid login payload: {error}")))?;
        payload.try_into()
    }

    async fn create_report(
        &self,
        session: &Session,
        fields: &ReportFields,
        token: &IdempotencyToken,
    ) -> ApiResult<RemoteReport> {
        let body = RecordBody::new(fields, Some(token.as_str()), session.responder_id.as_deref());
        let request = self.authorized(self.client.post(self.config.records_url()), session);
        match self.send(request.json(&body)).await {
            Ok(response) => self.read_record(response).await,
            // 400 on a retried create usually means the id is taken by our earlier attempt
            Err(ApiError::Permanent(message)) => match self.get_record(session, token.as_str()).await {
                Ok(existing) => {
                    tracing::debug!(record = %existing.remote_id, "Create already applied");
                    Ok(existing)
                }
                Err(ApiError::NotFound(_)) => Err(ApiError::Permanent(message)),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        }
    }

    async fn update_report(
        &self,
        session: &Session,
        remote_id: &str,
        fields: &ReportFields,
        expected_revision: &str,
    ) -> ApiResult<RemoteReport> {
        // PocketBase has no conditional PATCH; compare `updated` first
        let current = self.get_record(session, remote_id).await?;
        if current.revision != expected_revision {
            return Err(ApiError::Conflict(format!(
                "record {remote_id} changed on server ({} != {expected_revision})",
                current.revision
            )));
        }
        let body = RecordBody::new(fields, None, None);
        let request = self.authorized(self.client.patch(self.config.record_url(remote_id)), session);
        let response = self.send(request.json(&body)).await?;
        self.read_record(response).await
    }

    async fn delete_report(&self, session: &Session, remote_id: &str) -> ApiResult<()> {
        let request = self.authorized(self.client.delete(self.config.record_url(remote_id)), session);
        self.send(request).await?;
        Ok(())
    }

    async fn fetch_report(&self, session: &Session, remote_id: &str) -> ApiResult<RemoteReport> {
        self.get_record(session, remote_id).await
    }

    async fn find_by_token(
        &self,
        session: &Session,
        token: &IdempotencyToken,
    ) -> ApiResult<Option<RemoteReport>> {
        match self.get_record(session, token.as_str()).await {
            Ok(record) => Ok(Some(record)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn upload_attachment(
        &self,
        session: &Session,
        remote_id: &str,
        upload: AttachmentUpload,
    ) -> ApiResult<UploadedAttachment> {
        let part = Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.mime_type)
            .map_err(|error| ApiError::Permanent(format!("invalid mime type: {error}")))?;
        // `field+` appends to a multi-file field instead of replacing it
        let form = Form::new().part(format!("{IMAGE_FIELD}+"), part);
        let request = self.authorized(self.client.patch(self.config.record_url(remote_id)), session);
        let response = self.send(request.multipart(form)).await?;
        let record = self.read_record(response).await?;
        let url = record.files.last().cloned().ok_or_else(|| {
            ApiError::Permanent(format!("record {remote_id} lists no uploaded files"))
        })?;
        Ok(UploadedAttachment {
            url,
            report_revision: Some(record.revision),
        })
    }
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    identity: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    record: AuthRecord,
}

#[derive(Debug, Deserialize)]
struct AuthRecord {
    id: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    /// Linked responder record id
    #[serde(default)]
    extension: String,
}

impl TryFrom<AuthResponse> for Session {
    type Error = ApiError;

    fn try_from(value: AuthResponse) -> ApiResult<Self> {
        let session = Self {
            token: value.token.trim().to_string(),
            user_id: value.record.id.trim().to_string(),
            full_name: format!("{} {}", value.record.first_name, value.record.last_name)
                .trim()
                .to_string(),
            responder_id: Some(value.record.extension.trim().to_string())
                .filter(|id| !id.is_empty()),
        };
        if session.is_valid() {
            Ok(session)
        } else {
            Err(ApiError::Permanent(
                "login response did not include token and record id".to_string(),
            ))
        }
    }
}

#[derive(Serialize)]
struct RecordBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    title: &'a str,
    #[serde(rename = "type")]
    incident_type: &'a str,
    description: &'a str,
    status: &'a str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    occurred_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    responders: Option<&'a str>,
}

impl<'a> RecordBody<'a> {
    fn new(fields: &'a ReportFields, id: Option<&'a str>, responder: Option<&'a str>) -> Self {
        Self {
            id,
            title: &fields.title,
            incident_type: &fields.incident_type,
            description: &fields.description,
            status: fields.status.as_str(),
            latitude: fields.location.map(|location| location.latitude),
            longitude: fields.location.map(|location| location.longitude),
            occurred_at: fields.occurred_at,
            responders: responder,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordResponse {
    id: String,
    #[serde(default)]
    collection_id: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    updated: String,
    #[serde(default)]
    title: String,
    #[serde(default, rename = "type")]
    incident_type: Option<String>,
    /// Older schemas used `incident_type`
    #[serde(default, rename = "incident_type")]
    legacy_incident_type: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    latitude: Value,
    #[serde(default)]
    longitude: Value,
    #[serde(default, rename = "occurred_at")]
    occurred_at: Option<i64>,
    #[serde(default, rename = "incident_image")]
    incident_image: Value,
}

impl RecordResponse {
    fn into_remote(self, config: &ApiConfig) -> RemoteReport {
        let location = match (number(&self.latitude), number(&self.longitude)) {
            (Some(latitude), Some(longitude)) => Location::new(latitude, longitude).ok(),
            _ => None,
        };
        let occurred_at = self
            .occurred_at
            .filter(|value| *value > 0)
            .or_else(|| parse_timestamp(&self.created))
            .unwrap_or_default();
        let files = file_names(&self.incident_image)
            .into_iter()
            .map(|name| config.file_url(&self.collection_id, &self.id, &name))
            .collect();
        let incident_type = self
            .incident_type
            .filter(|value| !value.is_empty())
            .or(self.legacy_incident_type)
            .unwrap_or_default();

        RemoteReport {
            remote_id: self.id,
            revision: self.updated,
            fields: ReportFields {
                title: self.title,
                description: self.description,
                incident_type,
                status: self.status.parse().unwrap_or(IncidentStatus::Pending),
                location,
                occurred_at,
            },
            files,
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// `incident_image` is a string for single-file fields and an array otherwise.
fn file_names(value: &Value) -> Vec<String> {
    match value {
        Value::String(name) if !name.is_empty() => vec![name.clone()],
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

/// Parse `PocketBase` timestamps such as `2024-05-01 08:30:00.123Z`.
fn parse_timestamp(value: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.fZ")
        .ok()
        .map(|timestamp| timestamp.and_utc().timestamp_millis())
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = payload.message {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }
    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn classify_status(status: StatusCode, body: &str) -> ApiError {
    let message = error_message(status, body);
    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ApiError::Conflict(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ApiError::Transient(message),
        status if status.is_server_error() => ApiError::Transient(message),
        _ => ApiError::Permanent(message),
    }
}

fn classify_transport_error(error: reqwest::Error) -> ApiError {
    if error.is_timeout() {
        ApiError::Timeout
    } else if error.is_builder() || error.is_decode() {
        ApiError::Permanent(error.to_string())
    } else {
        ApiError::Transient(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> ApiConfig {
        ApiConfig::new("https://pb.example.com").unwrap()
    }

    #[test]
    fn status_codes_map_to_error_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::PRECONDITION_FAILED, ""),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, ""),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            ApiError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            ApiError::Permanent(_)
        ));
    }

    #[test]
    fn error_message_prefers_json_message() {
        let body = r#"{"code":400,"message":"Failed to create record.","data":{}}"#;
        assert_eq!(
            error_message(StatusCode::BAD_REQUEST, body),
            "Failed to create record. (400)"
        );
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
    }

    #[test]
    fn record_response_maps_fields_and_files() {
        let payload = serde_json::json!({
            "id": "abc123def456ghi",
            "collectionId": "col1",
            "created": "2024-05-01 08:30:00.000Z",
            "updated": "2024-05-01 09:00:00.000Z",
            "title": "Flood",
            "type": "Flood",
            "description": "Street under water",
            "status": "ongoing",
            "latitude": "14.5995",
            "longitude": 120.9842,
            "incident_image": ["photo_x1.jpg"]
        });
        let record: RecordResponse = serde_json::from_value(payload).unwrap();

        let remote = record.into_remote(&config());
        assert_eq!(remote.remote_id, "abc123def456ghi");
        assert_eq!(remote.revision, "2024-05-01 09:00:00.000Z");
        assert_eq!(remote.fields.status, IncidentStatus::Ongoing);
        assert_eq!(remote.fields.incident_type, "Flood");
        assert_eq!(remote.fields.occurred_at, 1_714_552_200_000);
        assert_eq!(
            remote.fields.location.map(|location| location.latitude),
            Some(14.5995)
        );
        assert_eq!(
            remote.files,
            vec!["https://pb.example.com/api/files/col1/abc123def456ghi/photo_x1.jpg".to_string()]
        );
    }

    #[test]
    fn record_response_falls_back_to_legacy_type_field() {
        let payload = serde_json::json!({
            "id": "abc",
            "incident_type": "Fire",
            "incident_image": "single.png"
        });
        let record: RecordResponse = serde_json::from_value(payload).unwrap();

        let remote = record.into_remote(&config());
        assert_eq!(remote.fields.incident_type, "Fire");
        assert_eq!(remote.files.len(), 1);
        assert_eq!(remote.fields.location, None);
    }

    #[test]
    fn auth_response_builds_session() {
        let payload = serde_json::json!({
            "token": "jwt",
            "record": {"id": "user1", "first_name": "Ana", "last_name": "Cruz", "extension": ""}
        });
        let response: AuthResponse = serde_json::from_value(payload).unwrap();

        let session = Session::try_from(response).unwrap();
        assert_eq!(session.full_name, "Ana Cruz");
        assert_eq!(session.responder_id, None);
    }

    #[test]
    fn record_body_uses_token_as_id() {
        let fields = crate::models::ReportDraft::new("t")
            .with_type("Fire")
            .into_fields(5)
            .unwrap();
        let body = serde_json::to_value(RecordBody::new(&fields, Some("tok"), Some("resp"))).unwrap();
        assert_eq!(body["id"], "tok");
        assert_eq!(body["type"], "Fire");
        assert_eq!(body["responders"], "resp");
        assert_eq!(body["latitude"], Value::Null);
    }

    /// Requires a running server; set `POCKETBASE_URL` (and credentials) to run.
    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires a live PocketBase server"]
    async fn live_login_round_trip() {
        dotenvy::dotenv().ok();
        let Some(config) = ApiConfig::from_env().unwrap() else {
            return;
        };
        let identity = std::env::var("POCKETBASE_TEST_EMAIL").unwrap_or_default();
        let password = std::env::var("POCKETBASE_TEST_PASSWORD").unwrap_or_default();
        let client = PocketBaseClient::new(config).unwrap();

        let session = client.login(&identity, &password).await.unwrap();
        assert!(session.is_valid());
    }
}
