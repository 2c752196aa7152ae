use sqlx::PgPool;

use crate::services::{assistant::Assistant, documents::DocumentStorage, integrations::IntegrationManager};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub jwt_secret: String,
    pub integrations: IntegrationManager,
    pub assistant: Assistant,
    pub documents: DocumentStorage,
    pub max_upload_bytes: usize,
}
