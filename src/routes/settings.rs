use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::record_activity,
    auth::{internal_error, AuthenticatedUser},
    models::Agency,
    state::AppState,
};

const AGENCY_COLUMNS: &str = "id, name, license_number, phone, email, address, city, state, zip_code, \
     website, settings, created_at, updated_at";

#[derive(Deserialize)]
pub struct UpdateAgencyRequest {
    pub name: Option<String>,
    pub license_number: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub website: Option<String>,
}

#[derive(Serialize)]
pub struct AgencyResponse {
    pub agency: Agency,
}

pub async fn get_agency(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<AgencyResponse>, (StatusCode, String)> {
    let agency = sqlx::query_as::<_, Agency>(&format!(
        "SELECT {AGENCY_COLUMNS} FROM agencies WHERE id = $1"
    ))
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Agency not found".to_string()))?;

    Ok(Json(AgencyResponse { agency }))
}

pub async fn update_agency(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateAgencyRequest>,
) -> Result<Json<AgencyResponse>, (StatusCode, String)> {
    if !user.is_admin() {
        return Err((
            StatusCode::FORBIDDEN,
            "Only admins can update agency settings".into(),
        ));
    }
    if matches!(payload.name.as_deref(), Some(name) if name.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "Agency name cannot be empty".into()));
    }

    let agency = sqlx::query_as::<_, Agency>(&format!(
        r#"
        UPDATE agencies
        SET name = COALESCE($1, name),
            license_number = COALESCE($2, license_number),
            phone = COALESCE($3, phone),
            email = COALESCE($4, email),
            address = COALESCE($5, address),
            city = COALESCE($6, city),
            state = COALESCE($7, state),
            zip_code = COALESCE($8, zip_code),
            website = COALESCE($9, website),
            updated_at = NOW()
        WHERE id = $10
        RETURNING {AGENCY_COLUMNS}
        "#
    ))
    .bind(payload.name.as_deref().map(str::trim))
    .bind(payload.license_number)
    .bind(payload.phone)
    .bind(payload.email)
    .bind(payload.address)
    .bind(payload.city)
    .bind(payload.state)
    .bind(payload.zip_code)
    .bind(payload.website)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Agency not found".to_string()))?;

    let _ = record_activity(
        &state.pool,
        &user,
        "agency_updated",
        "agency",
        Some(agency.id),
        json!({}),
    )
    .await;

    Ok(Json(AgencyResponse { agency }))
}
