mod audit;
mod auth;
mod config;
mod migrations;
mod models;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    config::Config,
    services::{
        assistant::Assistant,
        documents::DocumentStorage,
        integrations::{IntegrationManager, SimulatedSync, SystemClock},
        settings_store::PgSettingsStore,
    },
    state::AppState,
};

/// Multipart framing on top of the largest accepted file.
const BODY_LIMIT_HEADROOM: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    auth::ensure_database(&pool)
        .await
        .expect("database not reachable");
    migrations::run_with_repair(&pool)
        .await
        .expect("failed to run migrations");

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .expect("failed to create upload directory");

    let integrations = IntegrationManager::start(
        Arc::new(PgSettingsStore::new(pool.clone())),
        Arc::new(SystemClock),
        Arc::new(SimulatedSync::new(config.integration_sync_delay)),
    );
    let assistant = Assistant::new(config.gemini_api_key.clone(), config.gemini_model.clone());
    if assistant.is_demo() {
        tracing::warn!("GEMINI_API_KEY not set; AI assistant runs in demo mode");
    }

    let state = AppState {
        pool,
        jwt_secret: config.jwt_secret.clone(),
        integrations,
        assistant,
        documents: DocumentStorage::new(
            config.upload_dir.clone(),
            config.public_files_url.clone(),
        ),
        max_upload_bytes: config.max_upload_bytes,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        .route("/api/me", get(auth::me).patch(auth::update_me))
        .route(
            "/api/settings/profile",
            get(auth::me).patch(auth::update_me),
        )
        .route(
            "/api/settings/agency",
            get(routes::settings::get_agency).patch(routes::settings::update_agency),
        )
        .route(
            "/api/integrations",
            get(routes::integrations::list_integrations)
                .post(routes::integrations::apply_integration_action),
        )
        .route(
            "/api/integrations/catalog",
            get(routes::integrations::list_integrations_catalog),
        )
        .route(
            "/api/clients",
            get(routes::clients::list_clients).post(routes::clients::create_client),
        )
        .route(
            "/api/clients/{id}",
            get(routes::clients::get_client)
                .patch(routes::clients::update_client)
                .delete(routes::clients::delete_client),
        )
        .route(
            "/api/policies",
            get(routes::policies::list_policies).post(routes::policies::create_policy),
        )
        .route(
            "/api/policies/{id}",
            axum::routing::patch(routes::policies::update_policy)
                .delete(routes::policies::delete_policy),
        )
        .route("/api/carriers", get(routes::carriers::list_carriers))
        .route(
            "/api/documents",
            get(routes::documents::list_documents).post(routes::documents::create_document),
        )
        .route("/api/documents/upload", post(routes::documents::upload_document))
        .route(
            "/api/documents/{id}",
            get(routes::documents::get_document)
                .patch(routes::documents::update_document)
                .delete(routes::documents::delete_document),
        )
        .route(
            "/api/admin/users",
            get(routes::admin::list_users)
                .post(routes::admin::invite_user)
                .patch(routes::admin::update_user)
                .delete(routes::admin::delete_user),
        )
        .route("/api/dashboard/stats", get(routes::dashboard::stats))
        .route(
            "/api/dashboard/expiring-policies",
            get(routes::dashboard::expiring_policies),
        )
        .route("/api/dashboard/activity", get(routes::dashboard::activity))
        .route("/api/reports", get(routes::reports::get_report))
        .route(
            "/api/ai/conversations",
            get(routes::ai::list_conversations).post(routes::ai::create_conversation),
        )
        .route(
            "/api/ai/conversations/{id}",
            get(routes::ai::get_conversation)
                .patch(routes::ai::update_conversation)
                .delete(routes::ai::delete_conversation),
        )
        .route("/api/ai/chat", post(routes::ai::chat))
        .nest_service("/files", ServeDir::new(&config.upload_dir))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes + BODY_LIMIT_HEADROOM))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state);

    tracing::info!("AgencyHub API listening on {}", config.bind_addr);

    axum::serve(
        tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .expect("failed to bind address"),
        app,
    )
    .await
    .expect("server error");
}

async fn health() -> &'static str {
    "ok"
}
