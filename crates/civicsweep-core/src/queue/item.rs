use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Kinds of mutating action the queue can replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    #[serde(rename = "report.create")]
    ReportCreate,
    #[serde(rename = "vendor.complete")]
    VendorComplete,
    #[serde(rename = "admin.assign")]
    AdminAssign,
    #[serde(rename = "admin.status")]
    AdminStatus,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::ReportCreate,
        QueueKind::VendorComplete,
        QueueKind::AdminAssign,
        QueueKind::AdminStatus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::ReportCreate => "report.create",
            QueueKind::VendorComplete => "vendor.complete",
            QueueKind::AdminAssign => "admin.assign",
            QueueKind::AdminStatus => "admin.status",
        }
    }

    /// Fixed endpoint each kind is replayed against (always POST).
    pub fn path(&self) -> &'static str {
        match self {
            QueueKind::ReportCreate => "/reports",
            QueueKind::VendorComplete => "/reports/vendor/complete",
            QueueKind::AdminAssign => "/reports/assign",
            QueueKind::AdminStatus => "/reports/status",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PayloadError::UnknownKind(s.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PayloadError {
    #[error("Unknown action kind: {0}")]
    UnknownKind(String),

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: QueueKind, reason: String },

    #[error("Missing required field: {0}")]
    Missing(&'static str),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReport {
    pub reporter_id: String,
    pub category: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Photo as a data URL or upload reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorCompletion {
    pub report_id: String,
    pub vendor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub report_id: String,
    pub vendor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub report_id: String,
    pub status: ReportStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<String>,
}

fn require(field: &'static str, value: &str) -> Result<(), PayloadError> {
    if value.trim().is_empty() {
        Err(PayloadError::Missing(field))
    } else {
        Ok(())
    }
}

fn require_range(field: &'static str, value: f64, limit: f64) -> Result<(), PayloadError> {
    if value.is_finite() && (-limit..=limit).contains(&value) {
        Ok(())
    } else {
        Err(PayloadError::OutOfRange { field, value })
    }
}

/// A mutating action, typed by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueAction {
    NewReport(NewReport),
    VendorCompletion(VendorCompletion),
    Assignment(Assignment),
    StatusChange(StatusChange),
}

impl QueueAction {
    pub fn kind(&self) -> QueueKind {
        match self {
            QueueAction::NewReport(_) => QueueKind::ReportCreate,
            QueueAction::VendorCompletion(_) => QueueKind::VendorComplete,
            QueueAction::Assignment(_) => QueueKind::AdminAssign,
            QueueAction::StatusChange(_) => QueueKind::AdminStatus,
        }
    }

    pub fn endpoint(&self) -> &'static str {
        self.kind().path()
    }

    /// Parse and validate an untyped payload.
    pub fn from_parts(kind: QueueKind, payload: Value) -> Result<Self, PayloadError> {
        let action = Self::parse(kind, payload)?;
        action.validate()?;
        Ok(action)
    }

    /// Parse without validating. Used when restoring persisted items.
    fn parse(kind: QueueKind, payload: Value) -> Result<Self, PayloadError> {
        let malformed = |e: serde_json::Error| PayloadError::Malformed {
            kind,
            reason: e.to_string(),
        };
        Ok(match kind {
            QueueKind::ReportCreate => QueueAction::NewReport(serde_json::from_value(payload).map_err(malformed)?),
            QueueKind::VendorComplete => {
                QueueAction::VendorCompletion(serde_json::from_value(payload).map_err(malformed)?)
            }
            QueueKind::AdminAssign => QueueAction::Assignment(serde_json::from_value(payload).map_err(malformed)?),
            QueueKind::AdminStatus => QueueAction::StatusChange(serde_json::from_value(payload).map_err(malformed)?),
        })
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        match self {
            QueueAction::NewReport(r) => {
                require("reporterId", &r.reporter_id)?;
                require("category", &r.category)?;
                require("description", &r.description)?;
                require_range("latitude", r.latitude, 90.0)?;
                require_range("longitude", r.longitude, 180.0)
            }
            QueueAction::VendorCompletion(c) => {
                require("reportId", &c.report_id)?;
                require("vendorId", &c.vendor_id)
            }
            QueueAction::Assignment(a) => {
                require("reportId", &a.report_id)?;
                require("vendorId", &a.vendor_id)
            }
            QueueAction::StatusChange(s) => require("reportId", &s.report_id),
        }
    }

    /// JSON body sent to the endpoint.
    pub fn payload_value(&self) -> Value {
        let value = match self {
            QueueAction::NewReport(p) => serde_json::to_value(p),
            QueueAction::VendorCompletion(p) => serde_json::to_value(p),
            QueueAction::Assignment(p) => serde_json::to_value(p),
            QueueAction::StatusChange(p) => serde_json::to_value(p),
        };
        value.unwrap_or_default()
    }
}

// ============================================================================
// Queue items
// ============================================================================

/// A queued action awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredItem", into = "StoredItem")]
pub struct QueueItem {
    pub id: String,
    pub action: QueueAction,
    pub created_at: DateTime<Utc>,
    /// Set when the service rejected this item; it then blocks the queue
    pub error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(action: QueueAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            created_at: Utc::now(),
            error: None,
            failed_at: None,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.action.kind()
    }

    pub fn is_blocked(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn mark_failed(&mut self, error: String) {
        self.error = Some(error);
        self.failed_at = Some(Utc::now());
    }
}

/// Persisted form: `{ id, kind, payload, createdAt, error?, failedAt? }`.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredItem {
    id: String,
    kind: QueueKind,
    payload: Value,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StoredItem> for QueueItem {
    type Error = PayloadError;

    fn try_from(stored: StoredItem) -> Result<Self, Self::Error> {
        Ok(Self {
            id: stored.id,
            action: QueueAction::parse(stored.kind, stored.payload)?,
            created_at: stored.created_at,
            error: stored.error,
            failed_at: stored.failed_at,
        })
    }
}

impl From<QueueItem> for StoredItem {
    fn from(item: QueueItem) -> Self {
        Self {
            id: item.id,
            kind: item.action.kind(),
            payload: item.action.payload_value(),
            created_at: item.created_at,
            error: item.error,
            failed_at: item.failed_at,
        }
    }
}

// ============================================================================
// Status
// ============================================================================

/// The item currently holding up the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedItem {
    pub id: String,
    pub kind: QueueKind,
    pub error: String,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Snapshot of queue state for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub blocked: Option<BlockedItem>,
    pub online: bool,
    pub flushing: bool,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl QueueStatus {
    pub(crate) fn blocked_by(items: &[QueueItem]) -> Option<BlockedItem> {
        items.iter().find(|item| item.is_blocked()).map(|item| BlockedItem {
            id: item.id.clone(),
            kind: item.kind(),
            error: item.error.clone().unwrap_or_default(),
            failed_at: item.failed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report_payload() -> Value {
        json!({
            "reporterId": "u1",
            "category": "litter",
            "description": "Overflowing bin",
            "latitude": 12.97,
            "longitude": 77.59
        })
    }

    #[test]
    fn test_kind_parse_and_paths() {
        assert_eq!("report.create".parse::<QueueKind>().unwrap(), QueueKind::ReportCreate);
        assert_eq!("admin.status".parse::<QueueKind>().unwrap().path(), "/reports/status");
        assert_eq!(
            "report.delete".parse::<QueueKind>(),
            Err(PayloadError::UnknownKind("report.delete".to_string()))
        );
        for kind in QueueKind::ALL {
            assert_eq!(kind.to_string().parse::<QueueKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_from_parts_typed() {
        let action = QueueAction::from_parts(QueueKind::ReportCreate, report_payload()).unwrap();
        assert_eq!(action.kind(), QueueKind::ReportCreate);
        assert_eq!(action.endpoint(), "/reports");
        // Optional fields are omitted from the body
        assert_eq!(action.payload_value(), report_payload());

        let status = QueueAction::from_parts(
            QueueKind::AdminStatus,
            json!({"reportId": "r1", "status": "in_progress"}),
        )
        .unwrap();
        match status {
            QueueAction::StatusChange(change) => assert_eq!(change.status, ReportStatus::InProgress),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_from_parts_rejects_invalid_payloads() {
        let err = QueueAction::from_parts(QueueKind::AdminAssign, json!({"reportId": "r1"})).unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { kind: QueueKind::AdminAssign, .. }));

        let err = QueueAction::from_parts(QueueKind::AdminAssign, json!({"reportId": " ", "vendorId": "v1"}))
            .unwrap_err();
        assert_eq!(err, PayloadError::Missing("reportId"));

        let mut payload = report_payload();
        payload["latitude"] = json!(91.0);
        let err = QueueAction::from_parts(QueueKind::ReportCreate, payload).unwrap_err();
        assert_eq!(err, PayloadError::OutOfRange { field: "latitude", value: 91.0 });

        let err = QueueAction::from_parts(
            QueueKind::AdminStatus,
            json!({"reportId": "r1", "status": "archived"}),
        )
        .unwrap_err();
        assert!(matches!(err, PayloadError::Malformed { .. }));
    }

    #[test]
    fn test_item_persisted_form() {
        let action = QueueAction::from_parts(QueueKind::ReportCreate, report_payload()).unwrap();
        let mut item = QueueItem::new(action);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["kind"], "report.create");
        assert_eq!(value["payload"], report_payload());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("error").is_none());

        item.mark_failed("Invalid category".to_string());
        let restored: QueueItem = serde_json::from_value(serde_json::to_value(&item).unwrap()).unwrap();
        assert_eq!(restored, item);
        assert!(restored.is_blocked());
    }

    #[test]
    fn test_unknown_persisted_kind_fails() {
        let raw = json!({
            "id": "x",
            "kind": "report.delete",
            "payload": {},
            "createdAt": "2024-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<QueueItem>(raw).is_err());
    }

    #[test]
    fn test_blocked_by_finds_first_failed_item() {
        let action = QueueAction::from_parts(QueueKind::ReportCreate, report_payload()).unwrap();
        let ok = QueueItem::new(action.clone());
        let mut failed = QueueItem::new(action);
        failed.mark_failed("nope".to_string());

        assert!(QueueStatus::blocked_by(&[ok.clone()]).is_none());
        let blocked = QueueStatus::blocked_by(&[failed.clone(), ok]).unwrap();
        assert_eq!(blocked.id, failed.id);
        assert_eq!(blocked.error, "nope");
    }
}
