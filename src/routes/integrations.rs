use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    audit::record_activity,
    auth::AuthenticatedUser,
    services::integrations::{
        available_integrations, CatalogEntry, Integration, IntegrationAction, IntegrationConfig,
        IntegrationError,
    },
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Connect,
    Disconnect,
    Sync,
    Configure,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyIntegrationRequest {
    pub integration_id: String,
    pub action: ActionKind,
    pub config: Option<IntegrationConfig>,
}

impl ApplyIntegrationRequest {
    fn into_action(self) -> (String, IntegrationAction) {
        let action = match self.action {
            ActionKind::Connect => IntegrationAction::Connect {
                config: self.config,
            },
            ActionKind::Disconnect => IntegrationAction::Disconnect,
            ActionKind::Sync => IntegrationAction::Sync,
            ActionKind::Configure => IntegrationAction::Configure {
                config: self.config,
            },
        };
        (self.integration_id, action)
    }
}

#[derive(Serialize)]
pub struct IntegrationListResponse {
    pub integrations: Vec<Integration>,
}

#[derive(Serialize)]
pub struct ApplyIntegrationResponse {
    pub success: bool,
    pub integration: Integration,
}

#[derive(Serialize)]
pub struct IntegrationCatalogResponse {
    pub integrations: &'static [CatalogEntry],
}

pub async fn list_integrations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<IntegrationListResponse>, (StatusCode, String)> {
    let integrations = state
        .integrations
        .list(user.agency_id)
        .await
        .map_err(integration_error)?;
    Ok(Json(IntegrationListResponse { integrations }))
}

pub async fn list_integrations_catalog() -> Json<IntegrationCatalogResponse> {
    Json(IntegrationCatalogResponse {
        integrations: available_integrations(),
    })
}

pub async fn apply_integration_action(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ApplyIntegrationRequest>,
) -> Result<Json<ApplyIntegrationResponse>, (StatusCode, String)> {
    user.require_admin()?;

    let (integration_id, action) = payload.into_action();
    let action_name = action.name();
    let integration = state
        .integrations
        .apply(user.agency_id, &integration_id, action)
        .await
        .map_err(integration_error)?;

    let _ = record_activity(
        &state.pool,
        &user,
        &format!("integration_{action_name}"),
        "integration",
        None,
        json!({ "integration_id": integration.entry.id, "status": integration.state.status }),
    )
    .await;

    Ok(Json(ApplyIntegrationResponse {
        success: true,
        integration,
    }))
}

fn integration_error(error: IntegrationError) -> (StatusCode, String) {
    match error {
        IntegrationError::InvalidIntegration(_) => {
            (StatusCode::BAD_REQUEST, "Invalid integration".into())
        }
        IntegrationError::IntegrationNotConnected(_) => {
            (StatusCode::BAD_REQUEST, "Integration not connected".into())
        }
        IntegrationError::AgencyNotFound => (StatusCode::NOT_FOUND, "Agency not found".into()),
        IntegrationError::Storage(_) => crate::auth::internal_error(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: serde_json::Value) -> ApplyIntegrationRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn request_maps_to_tagged_action() {
        let (id, action) = request(json!({
            "integrationId": "hubspot",
            "action": "connect",
            "config": { "portalId": "123" }
        }))
        .into_action();
        assert_eq!(id, "hubspot");
        let IntegrationAction::Connect { config: Some(config) } = action else {
            panic!("expected connect with config");
        };
        assert_eq!(config["portalId"], "123");

        let (_, action) = request(json!({ "integrationId": "ivans", "action": "sync" })).into_action();
        assert_eq!(action, IntegrationAction::Sync);
    }

    #[test]
    fn unknown_action_is_rejected_at_decode() {
        let decoded = serde_json::from_value::<ApplyIntegrationRequest>(json!({
            "integrationId": "ivans",
            "action": "explode"
        }));
        assert!(decoded.is_err());
    }

    #[test]
    fn errors_map_to_client_statuses() {
        assert_eq!(
            integration_error(IntegrationError::InvalidIntegration("x".into())),
            (StatusCode::BAD_REQUEST, "Invalid integration".to_string())
        );
        assert_eq!(
            integration_error(IntegrationError::IntegrationNotConnected("ivans".into())).1,
            "Integration not connected"
        );
        assert_eq!(
            integration_error(IntegrationError::Storage("boom".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
