use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    audit::record_activity,
    models::{Language, UserProfile, UserRole},
    state::AppState,
};

const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub agency_name: Option<String>,
    pub full_name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub phone: Option<String>,
    pub preferred_language: Option<Language>,
    pub avatar_url: Option<String>,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub agency_id: Uuid,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    pub profile: UserProfile,
}

/// Caller resolved from a bearer token: the user, the agency that scopes every
/// query they make, and their role within it.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub agency_id: Uuid,
    pub role: UserRole,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn require_admin(&self) -> Result<(), (StatusCode, String)> {
        if self.is_admin() {
            Ok(())
        } else {
            Err((StatusCode::FORBIDDEN, "Insufficient permissions".into()))
        }
    }
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = (StatusCode, String);

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let jwt_secret = state.jwt_secret.clone();
        let pool = state.pool.clone();
        async move {
            let token = bearer_token(auth_header.as_deref())?;
            let user_id = verify_token(&jwt_secret, token)?;

            let record = sqlx::query(
                r#"
                SELECT agency_id, role, is_active
                FROM users
                WHERE id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&pool)
            .await
            .map_err(internal_error)?;

            let Some(record) = record else {
                return Err((StatusCode::UNAUTHORIZED, "Unknown user".into()));
            };

            let is_active: bool = record.try_get("is_active").map_err(internal_error)?;
            if !is_active {
                return Err((StatusCode::FORBIDDEN, "Account disabled".into()));
            }

            Ok(Self {
                id: user_id,
                agency_id: record.try_get("agency_id").map_err(internal_error)?,
                role: record.try_get("role").map_err(internal_error)?,
            })
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let email = payload.email.trim().to_lowercase();
    let full_name = payload.full_name.trim();
    if email.is_empty() || full_name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Name and email are required".into()));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Password must be at least {MIN_PASSWORD_LENGTH} characters"),
        ));
    }
    let password_hash = hash_password(&payload.password)?;

    // An invited user has a row but no password yet; registering claims it.
    let invitation = sqlx::query(
        r#"
        SELECT id, agency_id, role
        FROM users
        WHERE email = $1 AND password_hash IS NULL
        "#,
    )
    .bind(&email)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?;

    let user = if let Some(record) = invitation {
        let user = AuthenticatedUser {
            id: record.try_get("id").map_err(internal_error)?,
            agency_id: record.try_get("agency_id").map_err(internal_error)?,
            role: record.try_get("role").map_err(internal_error)?,
        };
        let claimed = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = $1,
                full_name = $2,
                is_active = TRUE,
                updated_at = NOW()
            WHERE id = $3 AND password_hash IS NULL
            "#,
        )
        .bind(password_hash)
        .bind(full_name)
        .bind(user.id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;
        ensure_invitation_claimed(claimed.rows_affected())?;
        user
    } else {
        let agency_name = payload
            .agency_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or((StatusCode::BAD_REQUEST, "Agency name is required".to_string()))?;
        let user = AuthenticatedUser {
            id: Uuid::new_v4(),
            agency_id: Uuid::new_v4(),
            role: UserRole::Admin,
        };

        let mut tx = state.pool.begin().await.map_err(internal_error)?;
        sqlx::query(
            r#"
            INSERT INTO agencies (id, name)
            VALUES ($1, $2)
            "#,
        )
        .bind(user.agency_id)
        .bind(agency_name)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

        sqlx::query(
            r#"
            INSERT INTO users (id, agency_id, email, full_name, password_hash, role)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(user.agency_id)
        .bind(&email)
        .bind(full_name)
        .bind(password_hash)
        .bind(user.role)
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                (StatusCode::CONFLICT, "Email already registered".to_string())
            } else {
                internal_error(error)
            }
        })?;

        tx.commit().await.map_err(internal_error)?;
        user
    };

    let _ = record_activity(
        &state.pool,
        &user,
        "user_registered",
        "user",
        Some(user.id),
        serde_json::json!({ "email": email }),
    )
    .await;

    let token = issue_token(&state.jwt_secret, user.id)?;
    Ok(Json(AuthResponse {
        token,
        user_id: user.id,
        agency_id: user.agency_id,
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let invalid = || (StatusCode::UNAUTHORIZED, "Invalid credentials".to_string());
    let record = sqlx::query(
        r#"
        SELECT id, agency_id, password_hash, is_active
        FROM users
        WHERE email = $1
        "#,
    )
    .bind(payload.email.trim().to_lowercase())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(invalid)?;

    let password_hash: Option<String> = record
        .try_get("password_hash")
        .map_err(internal_error)?;
    let is_active: bool = record.try_get("is_active").map_err(internal_error)?;
    let Some(password_hash) = password_hash.filter(|_| is_active) else {
        return Err(invalid());
    };
    verify_password(&payload.password, &password_hash)?;

    let user_id: Uuid = record.try_get("id").map_err(internal_error)?;
    let agency_id: Uuid = record.try_get("agency_id").map_err(internal_error)?;

    tracing::info!(%user_id, %agency_id, "user logged in");

    let token = issue_token(&state.jwt_secret, user_id)?;
    Ok(Json(AuthResponse {
        token,
        user_id,
        agency_id,
    }))
}

pub async fn me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<ProfileResponse>, (StatusCode, String)> {
    let profile = sqlx::query_as::<_, UserProfile>(
        r#"
        SELECT id, agency_id, email, full_name, role, preferred_language,
               avatar_url, phone, is_active, created_at, updated_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ProfileResponse { profile }))
}

pub async fn update_me(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<ProfileResponse>, (StatusCode, String)> {
    if matches!(payload.full_name.as_deref(), Some(name) if name.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "Name cannot be empty".into()));
    }

    let profile = sqlx::query_as::<_, UserProfile>(
        r#"
        UPDATE users
        SET full_name = COALESCE($1, full_name),
            phone = COALESCE($2, phone),
            preferred_language = COALESCE($3, preferred_language),
            avatar_url = COALESCE($4, avatar_url),
            updated_at = NOW()
        WHERE id = $5
        RETURNING id, agency_id, email, full_name, role, preferred_language,
                  avatar_url, phone, is_active, created_at, updated_at
        "#,
    )
    .bind(payload.full_name.as_deref().map(str::trim))
    .bind(payload.phone)
    .bind(payload.preferred_language)
    .bind(payload.avatar_url)
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(Json(ProfileResponse { profile }))
}

fn bearer_token(header: Option<&str>) -> Result<&str, (StatusCode, String)> {
    header
        .ok_or((StatusCode::UNAUTHORIZED, "Missing auth header".to_string()))?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or((StatusCode::UNAUTHORIZED, "Invalid auth header".to_string()))
}

fn issue_token(secret: &str, user_id: Uuid) -> Result<String, (StatusCode, String)> {
    let exp = (Utc::now() + Duration::days(7)).timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(internal_error)
}

fn verify_token(secret: &str, token: &str) -> Result<Uuid, (StatusCode, String)> {
    let claims = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".to_string()))?;
    Uuid::parse_str(&claims.claims.sub)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid user id".to_string()))
}

fn hash_password(password: &str) -> Result<String, (StatusCode, String)> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(internal_error)?;
    Ok(hash.to_string())
}

fn verify_password(password: &str, hash: &str) -> Result<(), (StatusCode, String)> {
    let parsed = PasswordHash::new(hash).map_err(internal_error)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid credentials".into()))
}

/// An invitation is claimed by exactly one registration; a concurrent one that
/// lost the race sees no row left without a password.
fn ensure_invitation_claimed(rows_affected: u64) -> Result<(), (StatusCode, String)> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err((StatusCode::CONFLICT, "Email already registered".to_string()))
    }
}

pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db_error| db_error.code())
        .is_some_and(|code| code == "23505")
}

pub fn internal_error<E: std::fmt::Display>(error: E) -> (StatusCode, String) {
    tracing::error!(%error, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

pub async fn ensure_database(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invitation_can_only_be_claimed_once() {
        assert!(ensure_invitation_claimed(1).is_ok());
        assert_eq!(
            ensure_invitation_claimed(0).unwrap_err(),
            (StatusCode::CONFLICT, "Email already registered".to_string())
        );
    }

    #[test]
    fn bearer_token_requires_prefix() {
        assert_eq!(bearer_token(Some("Bearer abc.def")).unwrap(), "abc.def");
        assert_eq!(
            bearer_token(None).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            bearer_token(Some("Basic dXNlcg==")).unwrap_err().1,
            "Invalid auth header"
        );
        assert!(bearer_token(Some("Bearer   ")).is_err());
    }

    #[test]
    fn issued_tokens_verify_only_with_their_secret() {
        let user_id = Uuid::new_v4();
        let token = issue_token("s3cret", user_id).unwrap();

        assert_eq!(verify_token("s3cret", &token).unwrap(), user_id);
        let (status, message) = verify_token("other", &token).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(message, "Invalid token");
    }

    #[test]
    fn password_hashes_verify() {
        let hash = hash_password("correct horse").unwrap();

        assert!(verify_password("correct horse", &hash).is_ok());
        assert_eq!(
            verify_password("battery staple", &hash).unwrap_err().0,
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn only_admins_pass_the_admin_gate() {
        let mut user = AuthenticatedUser {
            id: Uuid::new_v4(),
            agency_id: Uuid::new_v4(),
            role: UserRole::Admin,
        };
        assert!(user.require_admin().is_ok());

        user.role = UserRole::Agent;
        let (status, message) = user.require_admin().unwrap_err();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(message, "Insufficient permissions");
    }
}
