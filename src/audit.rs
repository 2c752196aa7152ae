use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;

/// Appends an entry to the agency's activity feed.
pub async fn record_activity(
    pool: &PgPool,
    user: &AuthenticatedUser,
    action: &str,
    entity_type: &str,
    entity_id: Option<Uuid>,
    details: Value,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO activity_log (id, agency_id, user_id, action, entity_type, entity_id, details)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user.agency_id)
    .bind(user.id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details)
    .execute(pool)
    .await?;

    Ok(())
}
