use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::{internal_error, AuthenticatedUser},
    models::{ChatMessage, Conversation, ConversationContext, MessageRole},
    state::AppState,
};

const CONVERSATION_COLUMNS: &str = "id, title, context_type, context_id, created_at, updated_at";
const HISTORY_LIMIT: i64 = 20;
const PREVIEW_CHARS: usize = 100;
const DEFAULT_TITLE: &str = "New Conversation";

#[derive(Deserialize)]
pub struct ConversationListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize, FromRow)]
pub struct ConversationSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub conversation: Conversation,
    #[serde(rename = "lastMessage")]
    pub last_message: String,
    #[serde(rename = "lastMessageRole")]
    pub last_message_role: Option<MessageRole>,
    #[serde(rename = "messageCount")]
    pub message_count: i64,
}

#[derive(Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub title: Option<String>,
    pub context_type: Option<ConversationContext>,
    pub context_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateConversationRequest {
    pub title: Option<String>,
}

#[derive(Serialize)]
pub struct ConversationResponse {
    pub conversation: Conversation,
}

#[derive(Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
pub struct ConversationDetailResponse {
    pub conversation: ConversationDetail,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: Option<String>,
    pub conversation_id: Option<Uuid>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response: String,
    pub conversation_id: Uuid,
}

fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

async fn owned_conversation(
    pool: &PgPool,
    user: &AuthenticatedUser,
    id: Uuid,
) -> Result<Conversation, (StatusCode, String)> {
    sqlx::query_as::<_, Conversation>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM ai_conversations WHERE id = $1 AND user_id = $2"
    ))
    .bind(id)
    .bind(user.id)
    .fetch_optional(pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Conversation not found".to_string()))
}

async fn insert_conversation(
    pool: &PgPool,
    user: &AuthenticatedUser,
    title: &str,
    context_type: ConversationContext,
    context_id: Option<Uuid>,
) -> Result<Conversation, (StatusCode, String)> {
    sqlx::query_as::<_, Conversation>(&format!(
        r#"
        INSERT INTO ai_conversations (id, agency_id, user_id, title, context_type, context_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {CONVERSATION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(user.id)
    .bind(title)
    .bind(context_type)
    .bind(context_id)
    .fetch_one(pool)
    .await
    .map_err(internal_error)
}

async fn insert_message(
    pool: &PgPool,
    conversation_id: Uuid,
    role: MessageRole,
    content: &str,
    tokens_used: Option<i32>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO ai_messages (id, conversation_id, role, content, tokens_used)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(conversation_id)
    .bind(role)
    .bind(content)
    .bind(tokens_used)
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ConversationListQuery>,
) -> Result<Json<ConversationListResponse>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(20).clamp(1, 100);
    let offset = params.offset.unwrap_or(0).max(0);

    let conversations = sqlx::query_as::<_, ConversationSummary>(
        r#"
        SELECT c.id,
               COALESCE(c.title, 'New Conversation') AS title,
               c.context_type,
               c.context_id,
               c.created_at,
               c.updated_at,
               COALESCE(LEFT(lm.content, 100), '') AS last_message,
               lm.role AS last_message_role,
               (SELECT COUNT(*) FROM ai_messages m WHERE m.conversation_id = c.id) AS message_count
        FROM ai_conversations c
        LEFT JOIN LATERAL (
            SELECT content, role
            FROM ai_messages m
            WHERE m.conversation_id = c.id
            ORDER BY m.created_at DESC
            LIMIT 1
        ) lm ON TRUE
        WHERE c.user_id = $1
        ORDER BY c.updated_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(user.id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ConversationListResponse { conversations }))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<Json<ConversationResponse>, (StatusCode, String)> {
    let title = non_blank(payload.title.as_deref()).unwrap_or(DEFAULT_TITLE);
    let conversation = insert_conversation(
        &state.pool,
        &user,
        title,
        payload.context_type.unwrap_or_default(),
        payload.context_id,
    )
    .await?;

    Ok(Json(ConversationResponse { conversation }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ConversationDetailResponse>, (StatusCode, String)> {
    let conversation = owned_conversation(&state.pool, &user, id).await?;
    let messages = sqlx::query_as::<_, ChatMessage>(
        r#"
        SELECT id, role, content, tokens_used, created_at
        FROM ai_messages
        WHERE conversation_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ConversationDetailResponse {
        conversation: ConversationDetail {
            conversation,
            messages,
        },
    }))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateConversationRequest>,
) -> Result<Json<ConversationResponse>, (StatusCode, String)> {
    let title = non_blank(payload.title.as_deref()).unwrap_or("Untitled");
    let conversation = sqlx::query_as::<_, Conversation>(&format!(
        r#"
        UPDATE ai_conversations
        SET title = $1, updated_at = NOW()
        WHERE id = $2 AND user_id = $3
        RETURNING {CONVERSATION_COLUMNS}
        "#
    ))
    .bind(title)
    .bind(id)
    .bind(user.id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Conversation not found".to_string()))?;

    Ok(Json(ConversationResponse { conversation }))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>, (StatusCode, String)> {
    owned_conversation(&state.pool, &user, id).await?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    sqlx::query("DELETE FROM ai_messages WHERE conversation_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    sqlx::query("DELETE FROM ai_conversations WHERE id = $1 AND user_id = $2")
        .bind(id)
        .bind(user.id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(SuccessResponse { success: true }))
}

pub async fn chat(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let message = non_blank(payload.message.as_deref())
        .ok_or((StatusCode::BAD_REQUEST, "Message is required".to_string()))?;

    let conversation = match payload.conversation_id {
        Some(id) => owned_conversation(&state.pool, &user, id).await?,
        None => {
            insert_conversation(
                &state.pool,
                &user,
                &preview(message),
                ConversationContext::General,
                None,
            )
            .await?
        }
    };

    insert_message(&state.pool, conversation.id, MessageRole::User, message, None)
        .await
        .map_err(internal_error)?;

    let mut history = sqlx::query_as::<_, ChatMessage>(
        r#"
        SELECT id, role, content, tokens_used, created_at
        FROM ai_messages
        WHERE conversation_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(conversation.id)
    .bind(HISTORY_LIMIT)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;
    history.reverse();

    let reply = state.assistant.reply(&history, message).await.map_err(|err| {
        error!(error = %err, conversation_id = %conversation.id, "AI reply failed");
        (StatusCode::BAD_GATEWAY, "Failed to generate AI response".to_string())
    })?;

    insert_message(
        &state.pool,
        conversation.id,
        MessageRole::Assistant,
        &reply.text,
        reply.tokens_used,
    )
    .await
    .map_err(internal_error)?;

    // The first exchange names the conversation after the opening message.
    let first_exchange = history.len() <= 1;
    sqlx::query(
        r#"
        UPDATE ai_conversations
        SET updated_at = NOW(),
            title = CASE WHEN $1 THEN $2 ELSE title END
        WHERE id = $3
        "#,
    )
    .bind(first_exchange)
    .bind(preview(message))
    .bind(conversation.id)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ChatResponse {
        response: reply.text,
        conversation_id: conversation.id,
    }))
}
