use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::warn;
use uuid::Uuid;

use crate::{
    audit::record_activity,
    auth::{internal_error, AuthenticatedUser},
    models::{
        parse_filter, AiProcessingStatus, Document, DocumentType, DocumentWithRelations, PageInfo,
    },
    services::documents::{validate_upload, UploadError},
    state::AppState,
};

const DOCUMENT_COLUMNS: &str = "id, agency_id, client_id, policy_id, name, type, file_path, file_size, \
     mime_type, ai_extracted_data, ai_processing_status, ai_processed_at, ivans_download_id, \
     ivans_download_date, created_by, created_at, updated_at";

const DOCUMENT_WITH_RELATIONS: &str = r#"
    SELECT d.id, d.agency_id, d.client_id, d.policy_id, d.name, d.type, d.file_path, d.file_size,
           d.mime_type, d.ai_extracted_data, d.ai_processing_status, d.ai_processed_at,
           d.ivans_download_id, d.ivans_download_date, d.created_by, d.created_at, d.updated_at,
           CASE WHEN c.id IS NULL THEN NULL ELSE jsonb_build_object(
               'id', c.id,
               'first_name', c.first_name,
               'last_name', c.last_name,
               'business_name', c.business_name
           ) END AS client,
           CASE WHEN p.id IS NULL THEN NULL ELSE jsonb_build_object(
               'id', p.id,
               'policy_number', p.policy_number
           ) END AS policy
    FROM documents d
    LEFT JOIN clients c ON c.id = d.client_id
    LEFT JOIN policies p ON p.id = d.policy_id
"#;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuery {
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub document_type: Option<String>,
    pub ai_status: Option<String>,
    pub client_id: Option<Uuid>,
    pub policy_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub document_type: Option<DocumentType>,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub client_id: Option<Uuid>,
    pub policy_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct UpdateDocumentRequest {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub document_type: Option<DocumentType>,
    pub client_id: Option<Uuid>,
    pub policy_id: Option<Uuid>,
    pub ai_extracted_data: Option<Value>,
    pub ai_processing_status: Option<AiProcessingStatus>,
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentWithRelations>,
    #[serde(flatten)]
    pub page: PageInfo,
}

#[derive(Serialize)]
pub struct DocumentResponse<T> {
    pub document: T,
}

#[derive(Serialize)]
pub struct UploadedDocument {
    #[serde(flatten)]
    pub document: Document,
    #[serde(rename = "publicUrl")]
    pub public_url: String,
}

fn upload_error(error: UploadError) -> (StatusCode, String) {
    match error {
        UploadError::MissingFile | UploadError::UnsupportedType | UploadError::TooLarge(_) => {
            (StatusCode::BAD_REQUEST, error.to_string())
        }
        UploadError::InvalidPath(_) | UploadError::Io(_) => internal_error(error),
    }
}

/// Empty form values mean "not linked".
fn optional_id(value: &str) -> Result<Option<Uuid>, (StatusCode, String)> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    Uuid::parse_str(value)
        .map(Some)
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid id: {value}")))
}

async fn ensure_links_in_agency(
    pool: &PgPool,
    agency_id: Uuid,
    client_id: Option<Uuid>,
    policy_id: Option<Uuid>,
) -> Result<(), (StatusCode, String)> {
    if let Some(client_id) = client_id {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND agency_id = $2)",
        )
        .bind(client_id)
        .bind(agency_id)
        .fetch_one(pool)
        .await
        .map_err(internal_error)?;
        if !exists {
            return Err((StatusCode::BAD_REQUEST, "Client not found".into()));
        }
    }
    if let Some(policy_id) = policy_id {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM policies WHERE id = $1 AND agency_id = $2)",
        )
        .bind(policy_id)
        .bind(agency_id)
        .fetch_one(pool)
        .await
        .map_err(internal_error)?;
        if !exists {
            return Err((StatusCode::BAD_REQUEST, "Policy not found".into()));
        }
    }
    Ok(())
}

fn push_document_filters(
    query: &mut QueryBuilder<'_, Postgres>,
    agency_id: Uuid,
    params: &DocumentQuery,
) {
    query.push(" WHERE d.agency_id = ");
    query.push_bind(agency_id);
    if let Some(search) = params.search.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        query.push(" AND d.name ILIKE ");
        query.push_bind(format!("%{search}%"));
    }
    if let Some(document_type) = parse_filter::<DocumentType>(params.document_type.as_deref()) {
        query.push(" AND d.type = ");
        query.push_bind(document_type);
    }
    if let Some(status) = parse_filter::<AiProcessingStatus>(params.ai_status.as_deref()) {
        query.push(" AND d.ai_processing_status = ");
        query.push_bind(status);
    }
    if let Some(client_id) = params.client_id {
        query.push(" AND d.client_id = ");
        query.push_bind(client_id);
    }
    if let Some(policy_id) = params.policy_id {
        query.push(" AND d.policy_id = ");
        query.push_bind(policy_id);
    }
}

pub async fn list_documents(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<DocumentQuery>,
) -> Result<Json<DocumentListResponse>, (StatusCode, String)> {
    let (page, limit, offset) = PageInfo::window(params.page, params.limit);

    let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM documents d");
    push_document_filters(&mut count_query, user.agency_id, &params);
    let total: i64 = count_query
        .build_query_scalar()
        .fetch_one(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut query = QueryBuilder::new(DOCUMENT_WITH_RELATIONS);
    push_document_filters(&mut query, user.agency_id, &params);
    query.push(" ORDER BY d.created_at DESC LIMIT ");
    query.push_bind(limit);
    query.push(" OFFSET ");
    query.push_bind(offset);
    let documents = query
        .build_query_as::<DocumentWithRelations>()
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(DocumentListResponse {
        documents,
        page: PageInfo::new(total, page, limit),
    }))
}

pub async fn create_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse<Document>>), (StatusCode, String)> {
    let name = payload.name.trim();
    if name.is_empty() || payload.file_path.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Name and file path are required".into()));
    }
    ensure_links_in_agency(&state.pool, user.agency_id, payload.client_id, payload.policy_id)
        .await?;

    let document = insert_document(
        &state.pool,
        &user,
        NewDocument {
            name,
            document_type: payload.document_type.unwrap_or(DocumentType::Other),
            file_path: payload.file_path.trim(),
            file_size: payload.file_size,
            mime_type: payload.mime_type.as_deref(),
            client_id: payload.client_id,
            policy_id: payload.policy_id,
        },
    )
    .await
    .map_err(internal_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        "document_created",
        "document",
        Some(document.id),
        json!({ "name": document.name }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(DocumentResponse { document })))
}

struct NewDocument<'a> {
    name: &'a str,
    document_type: DocumentType,
    file_path: &'a str,
    file_size: Option<i64>,
    mime_type: Option<&'a str>,
    client_id: Option<Uuid>,
    policy_id: Option<Uuid>,
}

async fn insert_document(
    pool: &PgPool,
    user: &AuthenticatedUser,
    new: NewDocument<'_>,
) -> Result<Document, sqlx::Error> {
    sqlx::query_as::<_, Document>(&format!(
        r#"
        INSERT INTO documents (
            id, agency_id, client_id, policy_id, name, type, file_path, file_size,
            mime_type, ai_processing_status, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', $10)
        RETURNING {DOCUMENT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(new.client_id)
    .bind(new.policy_id)
    .bind(new.name)
    .bind(new.document_type)
    .bind(new.file_path)
    .bind(new.file_size)
    .bind(new.mime_type)
    .bind(user.id)
    .fetch_one(pool)
    .await
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentResponse<UploadedDocument>>), (StatusCode, String)> {
    let mut file = None;
    let mut client_id = None;
    let mut policy_id = None;
    let mut document_type = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?
    {
        match field.name() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("document").to_string();
                let mime_type = field.content_type().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
                file = Some((file_name, mime_type, bytes));
            }
            Some("clientId") => {
                let value = field.text().await.map_err(internal_error)?;
                client_id = optional_id(&value)?;
            }
            Some("policyId") => {
                let value = field.text().await.map_err(internal_error)?;
                policy_id = optional_id(&value)?;
            }
            Some("documentType") => {
                document_type = Some(field.text().await.map_err(internal_error)?);
            }
            _ => {}
        }
    }

    let (file_name, mime_type, bytes) = file.ok_or_else(|| upload_error(UploadError::MissingFile))?;
    validate_upload(&mime_type, bytes.len(), state.max_upload_bytes).map_err(upload_error)?;
    ensure_links_in_agency(&state.pool, user.agency_id, client_id, policy_id).await?;
    let document_type =
        parse_filter::<DocumentType>(document_type.as_deref()).unwrap_or(DocumentType::Other);

    let file_path = state
        .documents
        .save(user.agency_id, &mime_type, &bytes)
        .await
        .map_err(upload_error)?;

    let inserted = insert_document(
        &state.pool,
        &user,
        NewDocument {
            name: &file_name,
            document_type,
            file_path: &file_path,
            file_size: Some(bytes.len() as i64),
            mime_type: Some(&mime_type),
            client_id,
            policy_id,
        },
    )
    .await;

    let document = match inserted {
        Ok(document) => document,
        Err(error) => {
            if let Err(cleanup) = state.documents.remove(&file_path).await {
                warn!(%cleanup, file_path = %file_path, "failed to remove orphaned upload");
            }
            return Err(internal_error(error));
        }
    };

    let _ = record_activity(
        &state.pool,
        &user,
        "document_uploaded",
        "document",
        Some(document.id),
        json!({ "name": document.name, "size": document.file_size }),
    )
    .await;

    let public_url = state.documents.public_url(&document.file_path);
    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse {
            document: UploadedDocument {
                document,
                public_url,
            },
        }),
    ))
}

pub async fn get_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentResponse<DocumentWithRelations>>, (StatusCode, String)> {
    let document = sqlx::query_as::<_, DocumentWithRelations>(&format!(
        "{DOCUMENT_WITH_RELATIONS} WHERE d.id = $1 AND d.agency_id = $2"
    ))
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Document not found".to_string()))?;

    Ok(Json(DocumentResponse { document }))
}

pub async fn update_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateDocumentRequest>,
) -> Result<Json<DocumentResponse<Document>>, (StatusCode, String)> {
    if matches!(payload.name.as_deref(), Some(name) if name.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "Name cannot be empty".into()));
    }
    ensure_links_in_agency(&state.pool, user.agency_id, payload.client_id, payload.policy_id)
        .await?;

    let processed = matches!(
        payload.ai_processing_status,
        Some(AiProcessingStatus::Completed | AiProcessingStatus::Failed)
    );

    let document = sqlx::query_as::<_, Document>(&format!(
        r#"
        UPDATE documents
        SET name = COALESCE($1, name),
            type = COALESCE($2, type),
            client_id = COALESCE($3, client_id),
            policy_id = COALESCE($4, policy_id),
            ai_extracted_data = COALESCE($5, ai_extracted_data),
            ai_processing_status = COALESCE($6, ai_processing_status),
            ai_processed_at = CASE WHEN $7 THEN NOW() ELSE ai_processed_at END,
            updated_at = NOW()
        WHERE id = $8 AND agency_id = $9
        RETURNING {DOCUMENT_COLUMNS}
        "#
    ))
    .bind(payload.name.as_deref().map(str::trim))
    .bind(payload.document_type)
    .bind(payload.client_id)
    .bind(payload.policy_id)
    .bind(payload.ai_extracted_data)
    .bind(payload.ai_processing_status)
    .bind(processed)
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Document not found".to_string()))?;

    Ok(Json(DocumentResponse { document }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let file_path: Option<String> = sqlx::query_scalar(
        "DELETE FROM documents WHERE id = $1 AND agency_id = $2 RETURNING file_path",
    )
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let Some(file_path) = file_path else {
        return Err((StatusCode::NOT_FOUND, "Document not found".into()));
    };

    if let Err(error) = state.documents.remove(&file_path).await {
        warn!(%error, file_path = %file_path, "failed to remove stored document");
    }

    let _ = record_activity(
        &state.pool,
        &user,
        "document_deleted",
        "document",
        Some(id),
        json!({}),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_form_ids_are_unlinked() {
        assert_eq!(optional_id("  ").unwrap(), None);
        let id = Uuid::new_v4();
        assert_eq!(optional_id(&id.to_string()).unwrap(), Some(id));
        assert_eq!(optional_id("nope").unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn validation_failures_are_client_errors() {
        assert_eq!(
            upload_error(UploadError::UnsupportedType),
            (
                StatusCode::BAD_REQUEST,
                "Invalid file type. Only PDF, JPG, and PNG are allowed.".to_string()
            )
        );
        assert_eq!(upload_error(UploadError::MissingFile).1, "No file provided");
        assert_eq!(
            upload_error(UploadError::InvalidPath("../x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn list_filters_skip_unknown_values() {
        let params = DocumentQuery {
            search: Some("dec".into()),
            document_type: Some("all".into()),
            ai_status: Some("completed".into()),
            client_id: None,
            policy_id: None,
            page: None,
            limit: None,
        };
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM documents d");
        push_document_filters(&mut query, Uuid::nil(), &params);
        assert_eq!(
            query.sql(),
            "SELECT COUNT(*) FROM documents d WHERE d.agency_id = $1 AND d.name ILIKE $2 AND d.ai_processing_status = $3"
        );
    }
}
