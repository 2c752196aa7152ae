use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, Row};
use uuid::Uuid;

use crate::{
    auth::{internal_error, AuthenticatedUser},
    models::{ActivityEntry, LineOfBusiness},
    services::reports::{days_until, round_to},
    state::AppState,
};

const RENEWAL_WINDOW_DAYS: i64 = 30;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_clients: i64,
    pub active_policies: i64,
    pub pending_renewals: i64,
    pub pending_documents: i64,
    pub monthly_premium: f64,
}

#[derive(Deserialize)]
pub struct ExpiringQuery {
    pub limit: Option<i64>,
    pub days: Option<i64>,
}

#[derive(FromRow)]
struct ExpiringRow {
    id: Uuid,
    policy_number: String,
    line_of_business: LineOfBusiness,
    premium: Option<f64>,
    expiration_date: Option<NaiveDate>,
    client: Option<Value>,
}

#[derive(Serialize)]
pub struct ExpiringPolicy {
    pub id: Uuid,
    pub policy_number: String,
    pub line_of_business: LineOfBusiness,
    pub premium: Option<f64>,
    pub expiration_date: Option<NaiveDate>,
    pub client: Option<Value>,
    #[serde(rename = "daysUntilExpiration")]
    pub days_until_expiration: Option<i64>,
}

#[derive(Serialize)]
pub struct ExpiringPoliciesResponse {
    pub policies: Vec<ExpiringPolicy>,
}

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct ActivityResponse {
    pub activities: Vec<ActivityEntry>,
}

pub async fn stats(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<DashboardStats>, (StatusCode, String)> {
    let today = Utc::now().date_naive();
    let renewal_horizon = today + Duration::days(RENEWAL_WINDOW_DAYS);

    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM clients WHERE agency_id = $1) AS total_clients,
            (SELECT COUNT(*) FROM policies WHERE agency_id = $1 AND status = 'active') AS active_policies,
            (SELECT COUNT(*) FROM policies
                WHERE agency_id = $1 AND status = 'active'
                  AND expiration_date BETWEEN $2 AND $3) AS pending_renewals,
            (SELECT COUNT(*) FROM documents
                WHERE agency_id = $1 AND ai_processing_status = 'pending') AS pending_documents,
            (SELECT COALESCE(SUM(premium), 0) FROM policies
                WHERE agency_id = $1 AND status = 'active') AS annual_premium
        "#,
    )
    .bind(user.agency_id)
    .bind(today)
    .bind(renewal_horizon)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let annual_premium: f64 = row.try_get("annual_premium").map_err(internal_error)?;
    Ok(Json(DashboardStats {
        total_clients: row.try_get("total_clients").map_err(internal_error)?,
        active_policies: row.try_get("active_policies").map_err(internal_error)?,
        pending_renewals: row.try_get("pending_renewals").map_err(internal_error)?,
        pending_documents: row.try_get("pending_documents").map_err(internal_error)?,
        monthly_premium: round_to(annual_premium / 12.0, 2),
    }))
}

pub async fn expiring_policies(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ExpiringQuery>,
) -> Result<Json<ExpiringPoliciesResponse>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(5).clamp(1, 100);
    let days = params.days.unwrap_or(RENEWAL_WINDOW_DAYS).clamp(0, 3650);
    let now = Utc::now();
    let today = now.date_naive();

    let rows = sqlx::query_as::<_, ExpiringRow>(
        r#"
        SELECT p.id, p.policy_number, p.line_of_business, p.premium, p.expiration_date,
               CASE WHEN c.id IS NULL THEN NULL ELSE jsonb_build_object(
                   'id', c.id,
                   'first_name', c.first_name,
                   'last_name', c.last_name,
                   'business_name', c.business_name,
                   'type', c.type
               ) END AS client
        FROM policies p
        LEFT JOIN clients c ON c.id = p.client_id
        WHERE p.agency_id = $1
          AND p.status = 'active'
          AND p.expiration_date BETWEEN $2 AND $3
        ORDER BY p.expiration_date ASC
        LIMIT $4
        "#,
    )
    .bind(user.agency_id)
    .bind(today)
    .bind(today + Duration::days(days))
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let policies = rows
        .into_iter()
        .map(|row| ExpiringPolicy {
            id: row.id,
            policy_number: row.policy_number,
            line_of_business: row.line_of_business,
            premium: row.premium,
            days_until_expiration: row.expiration_date.map(|date| days_until(date, now)),
            expiration_date: row.expiration_date,
            client: row.client,
        })
        .collect();

    Ok(Json(ExpiringPoliciesResponse { policies }))
}

pub async fn activity(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<ActivityQuery>,
) -> Result<Json<ActivityResponse>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(10).clamp(1, 100);

    let activities = sqlx::query_as::<_, ActivityEntry>(
        r#"
        SELECT a.id, a.user_id, u.full_name AS user_name, a.action, a.entity_type,
               a.entity_id, a.details, a.created_at
        FROM activity_log a
        LEFT JOIN users u ON u.id = a.user_id
        WHERE a.agency_id = $1
        ORDER BY a.created_at DESC
        LIMIT $2
        "#,
    )
    .bind(user.agency_id)
    .bind(limit)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ActivityResponse { activities }))
}
