use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::integrations::{IntegrationError, IntegrationState};

/// Computes the next state of one integration from its latest stored state.
/// `Ok(None)` leaves the entry untouched; an error aborts without writing.
pub type Transition<'a> = Box<
    dyn FnOnce(IntegrationState) -> Result<Option<IntegrationState>, IntegrationError> + Send + 'a,
>;

/// Per-agency settings document holding integration state under `integrations`.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn integrations(
        &self,
        agency_id: Uuid,
    ) -> Result<HashMap<String, IntegrationState>, IntegrationError>;

    /// Applies `transition` to the current entry for `integration_id` and
    /// merges the result back as a single key, leaving every other part of the
    /// document as stored. Returns the state in effect afterwards.
    async fn update_integration(
        &self,
        agency_id: Uuid,
        integration_id: &str,
        transition: Transition<'_>,
    ) -> Result<IntegrationState, IntegrationError>;
}

pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn integrations(
        &self,
        agency_id: Uuid,
    ) -> Result<HashMap<String, IntegrationState>, IntegrationError> {
        let entries: Option<Option<Value>> = sqlx::query_scalar(
            r#"
            SELECT settings->'integrations'
            FROM agencies
            WHERE id = $1
            "#,
        )
        .bind(agency_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(entries) = entries else {
            return Err(IntegrationError::AgencyNotFound);
        };

        let mut states = HashMap::new();
        if let Some(Value::Object(entries)) = entries {
            for (integration_id, value) in entries {
                let state = IntegrationState::from_stored(&integration_id, value);
                states.insert(integration_id, state);
            }
        }
        Ok(states)
    }

    async fn update_integration(
        &self,
        agency_id: Uuid,
        integration_id: &str,
        transition: Transition<'_>,
    ) -> Result<IntegrationState, IntegrationError> {
        let mut tx = self.pool.begin().await?;

        let entry: Option<Option<Value>> = sqlx::query_scalar(
            r#"
            SELECT settings->'integrations'->$2
            FROM agencies
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(agency_id)
        .bind(integration_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(entry) = entry else {
            return Err(IntegrationError::AgencyNotFound);
        };

        let current = entry
            .map(|value| IntegrationState::from_stored(integration_id, value))
            .unwrap_or_default();

        let Some(next) = transition(current.clone())? else {
            tx.rollback().await?;
            return Ok(current);
        };

        let value = serde_json::to_value(&next)?;
        sqlx::query(
            r#"
            UPDATE agencies
            SET settings = jsonb_set(
                    CASE WHEN jsonb_typeof(settings) = 'object' THEN settings ELSE '{}'::jsonb END,
                    '{integrations}',
                    CASE
                        WHEN jsonb_typeof(settings->'integrations') = 'object'
                            THEN settings->'integrations'
                        ELSE '{}'::jsonb
                    END || jsonb_build_object($2::text, $3::jsonb),
                    true
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(agency_id)
        .bind(integration_id)
        .bind(value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }
}
