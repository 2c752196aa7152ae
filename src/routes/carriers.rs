use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::QueryBuilder;

use crate::{
    auth::{internal_error, AuthenticatedUser},
    models::Carrier,
    state::AppState,
};

#[derive(Deserialize)]
pub struct CarrierQuery {
    pub search: Option<String>,
    pub active: Option<String>,
}

#[derive(Serialize)]
pub struct CarrierListResponse {
    pub carriers: Vec<Carrier>,
}

pub async fn list_carriers(
    State(state): State<AppState>,
    _user: AuthenticatedUser,
    Query(params): Query<CarrierQuery>,
) -> Result<Json<CarrierListResponse>, (StatusCode, String)> {
    let active_only = params.active.as_deref() != Some("false");

    let mut query = QueryBuilder::new(
        r#"
        SELECT id, name, ivans_code, supported_lines, website, phone, is_active,
               created_at, updated_at
        FROM carriers
        WHERE TRUE
        "#,
    );
    if let Some(search) = params.search.as_deref().map(str::trim).filter(|value| !value.is_empty()) {
        query.push(" AND name ILIKE ");
        query.push_bind(format!("%{search}%"));
    }
    if active_only {
        query.push(" AND is_active = TRUE");
    }
    query.push(" ORDER BY name ASC");

    let carriers = query
        .build_query_as::<Carrier>()
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(CarrierListResponse { carriers }))
}
