use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    audit::record_activity,
    auth::{internal_error, AuthenticatedUser},
    models::{parse_filter, LineOfBusiness, PageInfo, Policy, PolicyStatus, PolicyWithRelations},
    state::AppState,
};

const POLICY_COLUMNS: &str = "id, agency_id, client_id, carrier_id, policy_number, line_of_business, \
     status, effective_date, expiration_date, premium, notes, created_by, created_at, updated_at";

const POLICY_WITH_RELATIONS: &str = r#"
    SELECT p.id, p.agency_id, p.client_id, p.carrier_id, p.policy_number, p.line_of_business,
           p.status, p.effective_date, p.expiration_date, p.premium, p.notes, p.created_by,
           p.created_at, p.updated_at,
           CASE WHEN c.id IS NULL THEN NULL ELSE jsonb_build_object(
               'id', c.id,
               'first_name', c.first_name,
               'last_name', c.last_name,
               'business_name', c.business_name,
               'type', c.type
           ) END AS client,
           CASE WHEN ca.id IS NULL THEN NULL ELSE jsonb_build_object(
               'id', ca.id,
               'name', ca.name
           ) END AS carrier
    FROM policies p
    LEFT JOIN clients c ON c.id = p.client_id
    LEFT JOIN carriers ca ON ca.id = p.carrier_id
"#;

#[derive(Deserialize)]
pub struct PolicyQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub lob: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct CreatePolicyRequest {
    pub client_id: Uuid,
    pub carrier_id: Option<Uuid>,
    pub policy_number: String,
    pub line_of_business: LineOfBusiness,
    pub status: Option<PolicyStatus>,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub premium: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdatePolicyRequest {
    pub client_id: Option<Uuid>,
    pub carrier_id: Option<Uuid>,
    pub policy_number: Option<String>,
    pub line_of_business: Option<LineOfBusiness>,
    pub status: Option<PolicyStatus>,
    pub effective_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub premium: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Serialize)]
pub struct PolicyListResponse {
    pub policies: Vec<PolicyWithRelations>,
    #[serde(flatten)]
    pub page: PageInfo,
}

#[derive(Serialize)]
pub struct PolicyResponse {
    pub policy: Policy,
}

fn validate_term(
    effective_date: Option<NaiveDate>,
    expiration_date: Option<NaiveDate>,
) -> Result<(), (StatusCode, String)> {
    match (effective_date, expiration_date) {
        (Some(effective), Some(expiration)) if expiration < effective => Err((
            StatusCode::BAD_REQUEST,
            "Expiration date must not precede effective date".into(),
        )),
        _ => Ok(()),
    }
}

fn validate_premium(premium: Option<f64>) -> Result<(), (StatusCode, String)> {
    match premium {
        Some(value) if !value.is_finite() || value < 0.0 => {
            Err((StatusCode::BAD_REQUEST, "Premium must be a positive amount".into()))
        }
        _ => Ok(()),
    }
}

async fn ensure_client_in_agency(
    pool: &PgPool,
    agency_id: Uuid,
    client_id: Uuid,
) -> Result<(), (StatusCode, String)> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM clients WHERE id = $1 AND agency_id = $2)",
    )
    .bind(client_id)
    .bind(agency_id)
    .fetch_one(pool)
    .await
    .map_err(internal_error)?;
    if exists {
        Ok(())
    } else {
        Err((StatusCode::BAD_REQUEST, "Client not found".into()))
    }
}

fn push_policy_filters(
    query: &mut QueryBuilder<'_, Postgres>,
    agency_id: Uuid,
    search: Option<&str>,
    status: Option<PolicyStatus>,
    line_of_business: Option<LineOfBusiness>,
) {
    query.push(" WHERE p.agency_id = ");
    query.push_bind(agency_id);
    if let Some(search) = search.map(str::trim).filter(|value| !value.is_empty()) {
        query.push(" AND p.policy_number ILIKE ");
        query.push_bind(format!("%{search}%"));
    }
    if let Some(status) = status {
        query.push(" AND p.status = ");
        query.push_bind(status);
    }
    if let Some(line_of_business) = line_of_business {
        query.push(" AND p.line_of_business = ");
        query.push_bind(line_of_business);
    }
}

pub async fn list_policies(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<PolicyQuery>,
) -> Result<Json<PolicyListResponse>, (StatusCode, String)> {
    let (page, limit, offset) = PageInfo::window(params.page, params.limit);
    let status = parse_filter::<PolicyStatus>(params.status.as_deref());
    let line_of_business = parse_filter::<LineOfBusiness>(params.lob.as_deref());

    let mut count_query = QueryBuilder::new("SELECT COUNT(*) FROM policies p");
    push_policy_filters(
        &mut count_query,
        user.agency_id,
        params.search.as_deref(),
        status,
        line_of_business,
    );
    let total: i64 = count_query
        .build_query_scalar()
        .fetch_one(&state.pool)
        .await
        .map_err(internal_error)?;

    let mut query = QueryBuilder::new(POLICY_WITH_RELATIONS);
    push_policy_filters(
        &mut query,
        user.agency_id,
        params.search.as_deref(),
        status,
        line_of_business,
    );
    query.push(" ORDER BY p.created_at DESC LIMIT ");
    query.push_bind(limit);
    query.push(" OFFSET ");
    query.push_bind(offset);
    let policies = query
        .build_query_as::<PolicyWithRelations>()
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    Ok(Json(PolicyListResponse {
        policies,
        page: PageInfo::new(total, page, limit),
    }))
}

pub async fn create_policy(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreatePolicyRequest>,
) -> Result<(StatusCode, Json<PolicyResponse>), (StatusCode, String)> {
    let policy_number = payload.policy_number.trim();
    if policy_number.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Policy number is required".into()));
    }
    validate_term(payload.effective_date, payload.expiration_date)?;
    validate_premium(payload.premium)?;
    ensure_client_in_agency(&state.pool, user.agency_id, payload.client_id).await?;

    let policy = sqlx::query_as::<_, Policy>(&format!(
        r#"
        INSERT INTO policies (
            id, agency_id, client_id, carrier_id, policy_number, line_of_business, status,
            effective_date, expiration_date, premium, notes, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {POLICY_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(payload.client_id)
    .bind(payload.carrier_id)
    .bind(policy_number)
    .bind(payload.line_of_business)
    .bind(payload.status.unwrap_or(PolicyStatus::Quote))
    .bind(payload.effective_date)
    .bind(payload.expiration_date)
    .bind(payload.premium)
    .bind(payload.notes)
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        "policy_created",
        "policy",
        Some(policy.id),
        json!({ "policy_number": policy.policy_number, "line_of_business": policy.line_of_business }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(PolicyResponse { policy })))
}

pub async fn update_policy(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdatePolicyRequest>,
) -> Result<Json<PolicyResponse>, (StatusCode, String)> {
    if matches!(payload.policy_number.as_deref(), Some(number) if number.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "Policy number is required".into()));
    }
    validate_premium(payload.premium)?;
    if let Some(client_id) = payload.client_id {
        ensure_client_in_agency(&state.pool, user.agency_id, client_id).await?;
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let current = sqlx::query_as::<_, Policy>(&format!(
        "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1 AND agency_id = $2 FOR UPDATE"
    ))
    .bind(id)
    .bind(user.agency_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "Policy not found".to_string()))?;

    validate_term(
        payload.effective_date.or(current.effective_date),
        payload.expiration_date.or(current.expiration_date),
    )?;

    let policy = sqlx::query_as::<_, Policy>(&format!(
        r#"
        UPDATE policies
        SET client_id = COALESCE($1, client_id),
            carrier_id = COALESCE($2, carrier_id),
            policy_number = COALESCE($3, policy_number),
            line_of_business = COALESCE($4, line_of_business),
            status = COALESCE($5, status),
            effective_date = COALESCE($6, effective_date),
            expiration_date = COALESCE($7, expiration_date),
            premium = COALESCE($8, premium),
            notes = COALESCE($9, notes),
            updated_at = NOW()
        WHERE id = $10 AND agency_id = $11
        RETURNING {POLICY_COLUMNS}
        "#
    ))
    .bind(payload.client_id)
    .bind(payload.carrier_id)
    .bind(payload.policy_number.as_deref().map(str::trim))
    .bind(payload.line_of_business)
    .bind(payload.status)
    .bind(payload.effective_date)
    .bind(payload.expiration_date)
    .bind(payload.premium)
    .bind(payload.notes)
    .bind(id)
    .bind(user.agency_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    if policy.status != current.status {
        let _ = record_activity(
            &state.pool,
            &user,
            "policy_status_changed",
            "policy",
            Some(policy.id),
            json!({ "from": current.status, "to": policy.status }),
        )
        .await;
    }

    Ok(Json(PolicyResponse { policy }))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    let result = sqlx::query("DELETE FROM policies WHERE id = $1 AND agency_id = $2")
        .bind(id)
        .bind(user.agency_id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "Policy not found".into()));
    }

    let _ = record_activity(&state.pool, &user, "policy_deleted", "policy", Some(id), json!({})).await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y, m, d)
    }

    #[test]
    fn term_must_not_run_backwards() {
        assert!(validate_term(date(2026, 1, 1), date(2027, 1, 1)).is_ok());
        assert!(validate_term(date(2026, 1, 1), date(2026, 1, 1)).is_ok());
        assert!(validate_term(None, date(2026, 1, 1)).is_ok());
        assert_eq!(
            validate_term(date(2026, 6, 1), date(2026, 1, 1)).unwrap_err().0,
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn premium_must_be_a_real_amount() {
        assert!(validate_premium(None).is_ok());
        assert!(validate_premium(Some(0.0)).is_ok());
        assert!(validate_premium(Some(-1.0)).is_err());
        assert!(validate_premium(Some(f64::NAN)).is_err());
    }

    #[test]
    fn filters_are_scoped_to_the_agency() {
        let mut query = QueryBuilder::new("SELECT COUNT(*) FROM policies p");
        push_policy_filters(
            &mut query,
            Uuid::nil(),
            None,
            Some(PolicyStatus::Active),
            Some(LineOfBusiness::Health),
        );
        assert_eq!(
            query.sql(),
            "SELECT COUNT(*) FROM policies p WHERE p.agency_id = $1 AND p.status = $2 AND p.line_of_business = $3"
        );
    }
}
