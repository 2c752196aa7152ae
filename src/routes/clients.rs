use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    audit::record_activity,
    auth::{internal_error, AuthenticatedUser},
    models::{parse_filter, Client, ClientType, Language, PageInfo},
    state::AppState,
};

const CLIENT_COLUMNS: &str = "id, agency_id, type, first_name, last_name, business_name, email, phone, \
     secondary_phone, date_of_birth, address, city, state, zip_code, preferred_language, notes, tags, \
     external_id, created_by, created_at, updated_at";

#[derive(Deserialize)]
pub struct ClientQuery {
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub client_type: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "type")]
    pub client_type: Option<ClientType>,
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
    pub preferred_language: Option<Language>,
    pub notes: Option<String>,
    pub tags: Option<Vec<String>>,
    pub external_id: Option<String>,
}

#[derive(Serialize)]
pub struct ClientListResponse {
    pub clients: Vec<Client>,
    #[serde(flatten)]
    pub page: PageInfo,
}

#[derive(Serialize)]
pub struct ClientResponse {
    pub client: Client,
}

fn has_text(value: Option<&str>) -> bool {
    value.is_some_and(|value| !value.trim().is_empty())
}

fn validate_client(
    client_type: ClientType,
    first_name: Option<&str>,
    last_name: Option<&str>,
    business_name: Option<&str>,
) -> Result<(), (StatusCode, String)> {
    let named = match client_type {
        ClientType::Individual => has_text(first_name) || has_text(last_name),
        ClientType::Business => has_text(business_name),
    };
    if named {
        Ok(())
    } else {
        let message = match client_type {
            ClientType::Individual => "First or last name is required",
            ClientType::Business => "Business name is required",
        };
        Err((StatusCode::BAD_REQUEST, message.into()))
    }
}

fn push_client_filters(
    query: &mut QueryBuilder<'_, Postgres>,
    agency_id: Uuid,
    search: Option<&str>,
    client_type: Option<ClientType>,
) {
    query.push(" WHERE agency_id = ");
    query.push_bind(agency_id);
    if let Some(search) = search.map(str::trim).filter(|value| !value.is_empty()) {
        let pattern = format!("%{search}%");
        query.push(" AND (first_name ILIKE ");
        query.push_bind(pattern.clone());
        query.push(" OR last_name ILIKE ");
        query.push_bind(pattern.clone());
        query.push(" OR business_name ILIKE ");
        query.push_bind(pattern.clone());
        query.push(" OR email ILIKE ");
        query.push_bind(pattern);
        query.push(")");
    }
    if let Some(client_type) = client_type {
        query.push(" AND type = ");
        query.push_bind(client_type);
    }
}

pub async fn list_clients(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ClientQuery>,
) -> Result<Json<ClientListResponse>, (StatusCode, String)> {
    let (page, limit, offset) = PageInfo::window(params.page, params.limit);
    let client_type = parse_filter::<ClientType>(params.client_type.as_deref());

    let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM clients");
    push_client_filters(&mut count_query, user.agency_id, params.search.as_deref(), client_type);
    let total: i64 = count_query
        .build_query_scalar()
        .fetch_one(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut query = QueryBuilder::new(format!("SELECT {CLIENT_COLUMNS} FROM clients"));
    push_client_filters(&mut query, user.agency_id, params.search.as_deref(), client_type);
    query.push(" ORDER BY created_at DESC LIMIT ");
    query.push_bind(limit);
    query.push(" OFFSET ");
    query.push_bind(offset);
    let clients = query
        .build_query_as::<Client>()
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(ClientListResponse {
        clients,
        page: PageInfo::new(total, page, limit),
    }))
}

pub async fn create_client(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ClientRequest>,
) -> Result<(StatusCode, Json<ClientResponse>), (StatusCode, String)> {
    let client_type = payload.client_type.unwrap_or(ClientType::Individual);
    validate_client(
        client_type,
        payload.first_name.as_deref(),
        payload.last_name.as_deref(),
        payload.business_name.as_deref(),
    )?;

    let client = sqlx::query_as::<_, Client>(&format!(
        r#"
        INSERT INTO clients (
            id, agency_id, type, first_name, last_name, business_name, email, phone,
            secondary_phone, date_of_birth, address, city, state, zip_code,
            preferred_language, notes, tags, external_id, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        RETURNING {CLIENT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(client_type)
    .bind(payload.first_name)
    .bind(payload.last_name)
    .bind(payload.business_name)
    .bind(payload.email)
    .bind(payload.phone)
    .bind(payload.secondary_phone)
    .bind(payload.date_of_birth)
    .bind(payload.address)
    .bind(payload.city)
    .bind(payload.state)
    .bind(payload.zip_code)
    .bind(payload.preferred_language.unwrap_or_default())
    .bind(payload.notes)
    .bind(payload.tags.unwrap_or_default())
    .bind(payload.external_id)
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        "client_created",
        "client",
        Some(client.id),
        json!({ "type": client.client_type }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(ClientResponse { client })))
}

pub async fn get_client(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ClientResponse>, (StatusCode, String)> {
    let client = sqlx::query_as::<_, Client>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1 AND agency_id = $2"
    ))
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Client not found".to_string()))?;

    Ok(Json(ClientResponse { client }))
}

pub async fn update_client(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ClientRequest>,
) -> Result<Json<ClientResponse>, (StatusCode, String)> {
    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let current = sqlx::query_as::<_, Client>(&format!(
        "SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1 AND agency_id = $2 FOR UPDATE"
    ))
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Client not found".to_string()))?;

    let client_type = payload.client_type.unwrap_or(current.client_type);
    validate_client(
        client_type,
        payload.first_name.as_deref().or(current.first_name.as_deref()),
        payload.last_name.as_deref().or(current.last_name.as_deref()),
        payload.business_name.as_deref().or(current.business_name.as_deref()),
    )?;

    let client = sqlx::query_as::<_, Client>(&format!(
        r#"
        UPDATE clients
        SET type = $1,
            first_name = COALESCE($2, first_name),
            last_name = COALESCE($3, last_name),
            business_name = COALESCE($4, business_name),
            email = COALESCE($5, email),
            phone = COALESCE($6, phone),
            secondary_phone = COALESCE($7, secondary_phone),
            date_of_birth = COALESCE($8, date_of_birth),
            address = COALESCE($9, address),
            city = COALESCE($10, city),
            state = COALESCE($11, state),
            zip_code = COALESCE($12, zip_code),
            preferred_language = COALESCE($13, preferred_language),
            notes = COALESCE($14, notes),
            tags = COALESCE($15, tags),
            external_id = COALESCE($16, external_id),
            updated_at = NOW()
        WHERE id = $17 AND agency_id = $18
        RETURNING {CLIENT_COLUMNS}
        "#
    ))
    .bind(client_type)
    .bind(payload.first_name)
    .bind(payload.last_name)
    .bind(payload.business_name)
    .bind(payload.email)
    .bind(payload.phone)
    .bind(payload.secondary_phone)
    .bind(payload.date_of_birth)
    .bind(payload.address)
    .bind(payload.city)
    .bind(payload.state)
    .bind(payload.zip_code)
    .bind(payload.preferred_language)
    .bind(payload.notes)
    .bind(payload.tags)
    .bind(payload.external_id)
    .bind(id)
    .bind(user.agency_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        "client_updated",
        "client",
        Some(client.id),
        json!({}),
    )
    .await;

    Ok(Json(ClientResponse { client }))
}

pub async fn delete_client(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM clients WHERE id = $1 AND agency_id = $2")
        .bind(id)
        .bind(user.agency_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "Client not found".into()));
    }

    let _ = record_activity(
        &state.pool,
        &user,
        "client_deleted",
        "client",
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
    fn individuals_need_a_personal_name() {
        assert!(validate_client(ClientType::Individual, Some("Mei"), None, None).is_ok());
        assert!(validate_client(ClientType::Individual, None, Some("Chen"), None).is_ok());
        let (status, message) =
            validate_client(ClientType::Individual, Some("  "), None, Some("Acme")).unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message, "First or last name is required");
    }

    #[test]
    fn businesses_need_a_business_name() {
        assert!(validate_client(ClientType::Business, None, None, Some("Acme LLC")).is_ok());
        assert_eq!(
            validate_client(ClientType::Business, Some("Mei"), Some("Chen"), None)
                .unwrap_err()
                .1,
            "Business name is required"
        );
    }

    #[test]
    fn search_filters_every_name_column() {
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM clients");
        push_client_filters(&mut query, Uuid::nil(), Some(" lee "), Some(ClientType::Business));
        let sql = query.sql();
        assert!(sql.contains("WHERE agency_id = $1"));
        assert!(sql.contains("first_name ILIKE $2"));
        assert!(sql.contains("email ILIKE $5"));
        assert!(sql.ends_with("AND type = $6"));
    }
}
