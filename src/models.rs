//! Argus Core - Data Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// ============ User & Team Models ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ============ Sync Models ============

/// One location fix reported by a client. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    /// Client-reported timestamp in epoch milliseconds.
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
}

/// Map annotation, upserted by id. The payload is opaque to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
    #[serde(rename = "type")]
    pub category: String,
    pub data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
}

// Client payloads. Validation happens in the sync core, not here.

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationPayload {
    pub team_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPayload {
    pub team_id: Uuid,
    pub annotation_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub category: String,
    pub data: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub team_id: Uuid,
    pub message_type: MessageType,
    pub content: String,
}

/// Location broadcast fanned out to a team room after a durable write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBroadcast {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub timestamp: i64,
}

// ============ Monitor Models ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Monitor {
    pub id: Uuid,
    /// Free-text geographic area the monitor watches.
    pub area: String,
    pub focus: Option<String>,
    /// Host-only, lowercased, deduplicated. At most 5.
    pub allowed_domains: Vec<String>,
    pub interval_seconds: i64,
    pub active: bool,
    pub last_searched_at: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMonitorRequest {
    pub area: String,
    pub focus: Option<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    pub interval_seconds: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMonitorRequest {
    pub area: Option<String>,
    pub focus: Option<String>,
    pub allowed_domains: Option<Vec<String>>,
    pub interval_seconds: Option<i64>,
}

// ============ Threat Models ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatType {
    Violence,
    Terrorism,
    NaturalDisaster,
    CivilUnrest,
    Infrastructure,
    Cyber,
    HealthEmergency,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Violence => "VIOLENCE",
            Self::Terrorism => "TERRORISM",
            Self::NaturalDisaster => "NATURAL_DISASTER",
            Self::CivilUnrest => "CIVIL_UNREST",
            Self::Infrastructure => "INFRASTRUCTURE",
            Self::Cyber => "CYBER",
            Self::HealthEmergency => "HEALTH_EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatStatus {
    Pending,
    Reviewed,
    Approved,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatLocation {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub confidence: f64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_description: Option<String>,
}

/// One entry appended to a threat's update history when new information
/// about an existing incident arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatUpdate {
    pub timestamp: DateTime<Utc>,
    pub reasoning: String,
    pub changes: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_information: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threat {
    pub id: Uuid,
    pub level: ThreatLevel,
    pub threat_type: ThreatType,
    pub confidence: f64,
    pub summary: String,
    pub locations: Vec<ThreatLocation>,
    pub keywords: Vec<String>,
    pub citations: Vec<String>,
    pub area: String,
    pub semantic_hash: String,
    pub update_count: i64,
    pub update_history: Vec<ThreatUpdate>,
    pub status: ThreatStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A threat realized as a map entity for operator display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatAnnotation {
    pub id: Uuid,
    pub threat_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub level: ThreatLevel,
    pub threat_type: ThreatType,
    pub title: String,
    pub description: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One validated analysis returned by the search model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAnalysis {
    pub threat_level: ThreatLevel,
    pub threat_type: ThreatType,
    pub confidence_score: f64,
    pub summary: String,
    #[serde(default)]
    pub locations: Vec<ThreatLocation>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub citations: Vec<String>,
}

// ============ Pipeline Bookkeeping Models ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLog {
    pub id: Uuid,
    pub monitor_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub system_prompt: String,
    pub user_prompt: String,
    pub raw_response: String,
    pub threats_found: i64,
    pub citations: Option<Vec<String>>,
    pub request_payload: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiCallType {
    Search,
    Deduplication,
    Test,
    SuggestSources,
}

impl AiCallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Deduplication => "deduplication",
            Self::Test => "test",
            Self::SuggestSources => "suggest_sources",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiUsageEntry {
    pub id: Uuid,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub estimated_cost_usd: f64,
    pub call_type: AiCallType,
    pub monitor_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

// ============ Socket Events ============

/// Events accepted from an authenticated client channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "team:join")]
    TeamJoin {
        #[serde(rename = "teamId")]
        team_id: Uuid,
    },
    #[serde(rename = "team:leave")]
    TeamLeave {
        #[serde(rename = "teamId")]
        team_id: Uuid,
    },
    #[serde(rename = "location:update")]
    LocationUpdate(LocationPayload),
    #[serde(rename = "annotation:update")]
    AnnotationUpdate(AnnotationPayload),
    #[serde(rename = "message:send")]
    MessageSend(MessagePayload),
}

/// Events the server pushes to client channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(rename = "isAdmin")]
        is_admin: bool,
    },
    #[serde(rename = "team:joined")]
    TeamJoined {
        #[serde(rename = "teamId")]
        team_id: Uuid,
    },
    #[serde(rename = "team:left")]
    TeamLeft {
        #[serde(rename = "teamId")]
        team_id: Uuid,
    },
    #[serde(rename = "location:update")]
    LocationUpdate(LocationBroadcast),
    #[serde(rename = "annotation:update")]
    AnnotationUpdate(Annotation),
    #[serde(rename = "message:received")]
    MessageReceived(Message),
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "admin:new_threat_detected")]
    AdminNewThreatDetected {
        threat: Threat,
        #[serde(skip_serializing_if = "Option::is_none")]
        annotation: Option<ThreatAnnotation>,
    },
    #[serde(rename = "admin:threat_updated")]
    AdminThreatUpdated {
        threat: Threat,
        #[serde(skip_serializing_if = "Option::is_none")]
        annotation: Option<ThreatAnnotation>,
    },
    #[serde(rename = "admin:stats_update")]
    AdminStatsUpdate(JsonValue),
    #[serde(rename = "admin:sync_activity")]
    AdminSyncActivity(SyncActivity),
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::TeamJoined { .. } => "team:joined",
            Self::TeamLeft { .. } => "team:left",
            Self::LocationUpdate(_) => "location:update",
            Self::AnnotationUpdate(_) => "annotation:update",
            Self::MessageReceived(_) => "message:received",
            Self::Error { .. } => "error",
            Self::AdminNewThreatDetected { .. } => "admin:new_threat_detected",
            Self::AdminThreatUpdated { .. } => "admin:threat_updated",
            Self::AdminStatsUpdate(_) => "admin:stats_update",
            Self::AdminSyncActivity(_) => "admin:sync_activity",
        }
    }

}

/// Compact activity record pushed to admin subscribers after sync writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncActivity {
    pub kind: String,
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub at: DateTime<Utc>,
}

// ============ HTTP Request/Response Models ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub admin_email: String,
    pub admin_password: String,
    pub org_name: String,
    pub cors_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub username: Option<String>,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoamiResponse {
    pub id: Uuid,
    pub is_admin: bool,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub name: String,
    pub email: Option<String>,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfigResponse {
    pub org_name: Option<String>,
    pub cors_origin: Option<String>,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAdminConfigRequest {
    pub org_name: Option<String>,
    pub cors_origin: Option<String>,
    pub retention_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateThreatStatusRequest {
    pub status: ThreatStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestSourcesRequest {
    pub area: String,
}
