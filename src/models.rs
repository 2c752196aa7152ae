use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Agent,
    Staff,
}

impl UserRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Agent => "agent",
            UserRole::Staff => "staff",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "client_type", rename_all = "snake_case")]
pub enum ClientType {
    Individual,
    Business,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "policy_status", rename_all = "snake_case")]
pub enum PolicyStatus {
    Quote,
    Pending,
    Active,
    Cancelled,
    Expired,
    NonRenewed,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "line_of_business", rename_all = "snake_case")]
pub enum LineOfBusiness {
    PersonalAuto,
    Homeowners,
    Commercial,
    Health,
    Life,
    Other,
}

impl LineOfBusiness {
    pub const fn as_str(self) -> &'static str {
        match self {
            LineOfBusiness::PersonalAuto => "personal_auto",
            LineOfBusiness::Homeowners => "homeowners",
            LineOfBusiness::Commercial => "commercial",
            LineOfBusiness::Health => "health",
            LineOfBusiness::Life => "life",
            LineOfBusiness::Other => "other",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "document_type", rename_all = "snake_case")]
pub enum DocumentType {
    IdCard,
    DecPage,
    Application,
    Endorsement,
    Cancellation,
    Invoice,
    Claim,
    Other,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "ai_processing_status", rename_all = "snake_case")]
pub enum AiProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Default, sqlx::Type)]
#[sqlx(type_name = "language")]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    #[sqlx(rename = "en")]
    En,
    #[serde(rename = "zh-CN")]
    #[sqlx(rename = "zh-CN")]
    ZhCn,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Default, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "conversation_context", rename_all = "snake_case")]
pub enum ConversationContext {
    #[default]
    General,
    Client,
    Policy,
    Document,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, Eq, PartialEq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "message_role", rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Parses a list filter from a query string value. Empty values, `all`, and
/// unrecognized values mean "no filter".
pub fn parse_filter<T: DeserializeOwned>(value: Option<&str>) -> Option<T> {
    let value = value?.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("all") {
        return None;
    }
    serde_json::from_value(Value::String(value.to_string())).ok()
}

#[derive(Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub total_pages: i64,
}

impl PageInfo {
    /// Resolves `(page, limit, offset)` from raw query values. Pages past the
    /// end of the range saturate the offset instead of overflowing.
    pub fn window(page: Option<i64>, limit: Option<i64>) -> (i64, i64, i64) {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(10).clamp(1, 100);
        (page, limit, (page - 1).saturating_mul(limit))
    }

    pub fn new(total: i64, page: i64, limit: i64) -> Self {
        let total_pages = if total <= 0 { 0 } else { (total + limit - 1) / limit };
        Self {
            total,
            page,
            limit,
            total_pages,
        }
    }
}

#[derive(Serialize, FromRow)]
pub struct Agency {
    pub id: Uuid,
    pub name: String,
    pub license_number: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub website: Option<String>,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub preferred_language: Language,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct Client {
    pub id: Uuid,
    pub agency_id: Uuid,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub client_type: ClientType,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub business_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub secondary_phone: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub preferred_language: Language,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub external_id: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct Carrier {
    pub id: Uuid,
    pub name: String,
    pub ivans_code: Option<String>,
    pub supported_lines: Vec<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct Policy {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub client_id: Uuid,
    pub carrier_id: Option<Uuid>,
    pub policy_number: String,
    pub line_of_business: LineOfBusiness,
    pub status: PolicyStatus,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub premium: Option<f64>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Policy row with its client and carrier embedded as JSON objects.
#[derive(Serialize, FromRow)]
pub struct PolicyWithRelations {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub policy: Policy,
    pub client: Option<Value>,
    pub carrier: Option<Value>,
}

#[derive(Serialize, FromRow)]
pub struct Document {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub client_id: Option<Uuid>,
    pub policy_id: Option<Uuid>,
    pub name: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub document_type: DocumentType,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub ai_extracted_data: Option<Value>,
    pub ai_processing_status: Option<AiProcessingStatus>,
    pub ai_processed_at: Option<DateTime<Utc>>,
    pub ivans_download_id: Option<String>,
    pub ivans_download_date: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct DocumentWithRelations {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub document: Document,
    pub client: Option<Value>,
    pub policy: Option<Value>,
}

#[derive(Serialize, FromRow)]
pub struct ActivityEntry {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub user_name: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<Uuid>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow)]
pub struct Conversation {
    pub id: Uuid,
    pub title: Option<String>,
    pub context_type: ConversationContext,
    pub context_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, FromRow, Clone)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub tokens_used: Option<i32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_ignore_all_and_unknown_values() {
        assert_eq!(parse_filter::<PolicyStatus>(Some("all")), None);
        assert_eq!(parse_filter::<PolicyStatus>(Some("")), None);
        assert_eq!(parse_filter::<PolicyStatus>(Some("bogus")), None);
        assert_eq!(parse_filter::<PolicyStatus>(None), None);
        assert_eq!(
            parse_filter::<PolicyStatus>(Some("non_renewed")),
            Some(PolicyStatus::NonRenewed)
        );
        assert_eq!(parse_filter::<Language>(Some("zh-CN")), Some(Language::ZhCn));
    }

    #[test]
    fn page_window_clamps_inputs() {
        assert_eq!(PageInfo::window(None, None), (1, 10, 0));
        assert_eq!(PageInfo::window(Some(3), Some(25)), (3, 25, 50));
        assert_eq!(PageInfo::window(Some(0), Some(1000)), (1, 100, 0));
        assert_eq!(PageInfo::window(Some(-4), Some(0)), (1, 1, 0));
    }

    #[test]
    fn huge_pages_saturate_the_offset() {
        assert_eq!(
            PageInfo::window(Some(i64::MAX), Some(10)),
            (i64::MAX, 10, i64::MAX)
        );
        assert_eq!(
            PageInfo::window(Some(i64::MAX / 50), Some(100)),
            (i64::MAX / 50, 100, i64::MAX)
        );
    }

    #[test]
    fn total_pages_rounds_up() {
        assert_eq!(PageInfo::new(0, 1, 10).total_pages, 0);
        assert_eq!(PageInfo::new(10, 1, 10).total_pages, 1);
        assert_eq!(PageInfo::new(11, 2, 10).total_pages, 2);
    }
}
