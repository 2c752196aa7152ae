use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    audit::record_activity,
    auth::{internal_error, is_unique_violation, AuthenticatedUser},
    models::UserRole,
    state::AppState,
};

#[derive(FromRow)]
struct TeamRow {
    id: Uuid,
    email: String,
    full_name: String,
    role: UserRole,
    phone: Option<String>,
    avatar_url: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: &'static str,
    pub status: &'static str,
    pub avatar: Option<String>,
    pub last_login: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct TeamListResponse {
    pub users: Vec<TeamMember>,
}

#[derive(Deserialize)]
pub struct InviteUserRequest {
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<UserRole>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub user_id: Uuid,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteUserQuery {
    pub user_id: Option<Uuid>,
}

#[derive(Serialize)]
pub struct TeamMemberResponse {
    pub success: bool,
    pub user: TeamMember,
}

#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

fn status_label(is_active: bool) -> &'static str {
    if is_active {
        "active"
    } else {
        "inactive"
    }
}

/// The agency's first member is its owner when they are an admin.
fn display_role(position: usize, role: UserRole) -> &'static str {
    if position == 0 && role == UserRole::Admin {
        "owner"
    } else {
        role.as_str()
    }
}

impl TeamMember {
    fn from_row(row: TeamRow, role: &'static str) -> Self {
        Self {
            id: row.id,
            name: row.full_name,
            email: row.email,
            phone: row.phone,
            role,
            status: status_label(row.is_active),
            avatar: row.avatar_url,
            // Logins are not tracked separately; the last profile change stands in.
            last_login: row.updated_at,
            created_at: row.created_at,
        }
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<TeamListResponse>, (StatusCode, String)> {
    user.require_admin()?;

    let rows = sqlx::query_as::<_, TeamRow>(
        r#"
        SELECT id, email, full_name, role, phone, avatar_url, is_active, created_at, updated_at
        FROM users
        WHERE agency_id = $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(user.agency_id)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let users = rows
        .into_iter()
        .enumerate()
        .map(|(position, row)| {
            let role = display_role(position, row.role);
            TeamMember::from_row(row, role)
        })
        .collect();

    Ok(Json(TeamListResponse { users }))
}

pub async fn invite_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<InviteUserRequest>,
) -> Result<(StatusCode, Json<TeamMemberResponse>), (StatusCode, String)> {
    user.require_admin()?;

    let email = payload.email.as_deref().map(|email| email.trim().to_lowercase());
    let name = payload.name.as_deref().map(str::trim);
    let (Some(email), Some(name), Some(role)) = (email, name, payload.role) else {
        return Err((StatusCode::BAD_REQUEST, "Missing required fields".into()));
    };
    if email.is_empty() || name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing required fields".into()));
    }

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM users WHERE email = $1 AND agency_id = $2)",
    )
    .bind(&email)
    .bind(user.agency_id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;
    if exists {
        return Err((
            StatusCode::BAD_REQUEST,
            "User already exists in this agency".into(),
        ));
    }

    let row = sqlx::query_as::<_, TeamRow>(
        r#"
        INSERT INTO users (id, agency_id, email, full_name, role, is_active)
        VALUES ($1, $2, $3, $4, $5, FALSE)
        RETURNING id, email, full_name, role, phone, avatar_url, is_active, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(&email)
    .bind(name)
    .bind(role)
    .fetch_one(&state.pool)
    .await
    .map_err(|error| {
        if is_unique_violation(&error) {
            (StatusCode::CONFLICT, "Email already registered".to_string())
        } else {
            internal_error(error)
        }
    })?;

    let _ = record_activity(
        &state.pool,
        &user,
        "user_invited",
        "user",
        Some(row.id),
        json!({ "email": row.email, "role": row.role }),
    )
    .await;

    let mut member = TeamMember::from_row(row, role.as_str());
    member.status = "pending";
    Ok((
        StatusCode::CREATED,
        Json(TeamMemberResponse {
            success: true,
            user: member,
        }),
    ))
}

pub async fn update_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<TeamMemberResponse>, (StatusCode, String)> {
    user.require_admin()?;

    if payload.user_id == user.id {
        if payload.role.is_some_and(|role| role != UserRole::Admin) {
            return Err((
                StatusCode::BAD_REQUEST,
                "Cannot change your own admin role".into(),
            ));
        }
        if payload.is_active == Some(false) {
            return Err((
                StatusCode::BAD_REQUEST,
                "Cannot deactivate your own account".into(),
            ));
        }
    }

    let row = sqlx::query_as::<_, TeamRow>(
        r#"
        UPDATE users
        SET role = COALESCE($1, role),
            is_active = COALESCE($2, is_active),
            updated_at = NOW()
        WHERE id = $3 AND agency_id = $4
        RETURNING id, email, full_name, role, phone, avatar_url, is_active, created_at, updated_at
        "#,
    )
    .bind(payload.role)
    .bind(payload.is_active)
    .bind(payload.user_id)
    .bind(user.agency_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or((StatusCode::NOT_FOUND, "User not found".to_string()))?;

    let _ = record_activity(
        &state.pool,
        &user,
        "user_updated",
        "user",
        Some(row.id),
        json!({ "role": row.role, "is_active": row.is_active }),
    )
    .await;

    let role = row.role.as_str();
    Ok(Json(TeamMemberResponse {
        success: true,
        user: TeamMember::from_row(row, role),
    }))
}

pub async fn delete_user(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(params): Query<DeleteUserQuery>,
) -> Result<Json<SuccessResponse>, (StatusCode, String)> {
    user.require_admin()?;

    let target_id = params
        .user_id
        .ok_or((StatusCode::BAD_REQUEST, "User ID required".to_string()))?;
    if target_id == user.id {
        return Err((
            StatusCode::BAD_REQUEST,
            "Cannot delete your own account".into(),
        ));
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    // Holds the agency's admin rows until commit.
    let admins: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM users WHERE agency_id = $1 AND role = 'admin' FOR UPDATE",
    )
    .bind(user.agency_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?;

    let target_role: Option<UserRole> = sqlx::query_scalar(
        "SELECT role FROM users WHERE id = $1 AND agency_id = $2",
    )
    .bind(target_id)
    .bind(user.agency_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let Some(target_role) = target_role else {
        return Err((StatusCode::NOT_FOUND, "User not found".into()));
    };
    if target_role == UserRole::Admin && admins.len() <= 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Cannot delete the last admin".into(),
        ));
    }

    sqlx::query("DELETE FROM users WHERE id = $1 AND agency_id = $2")
        .bind(target_id)
        .bind(user.agency_id)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        "user_deleted",
        "user",
        Some(target_id),
        json!({}),
    )
    .await;

    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_admin_is_reported_as_owner() {
        assert_eq!(display_role(0, UserRole::Admin), "owner");
        assert_eq!(display_role(1, UserRole::Admin), "admin");
        assert_eq!(display_role(0, UserRole::Agent), "agent");
    }

    #[test]
    fn status_reflects_activation() {
        assert_eq!(status_label(true), "active");
        assert_eq!(status_label(false), "inactive");
    }

    #[test]
    fn delete_query_accepts_camel_case_id() {
        let id = Uuid::new_v4();
        let query: DeleteUserQuery =
            serde_json::from_value(json!({ "userId": id.to_string() })).unwrap();
        assert_eq!(query.user_id, Some(id));
    }
}
