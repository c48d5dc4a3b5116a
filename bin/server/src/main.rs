//! Gatehouse API server entry point.

mod config;
mod db;
mod routes;

use crate::config::ServerConfig;
use crate::db::{PgInvitationStore, PgUserDirectory};
use gatehouse_identity::TokenExchangeClient;
use gatehouse_invitation::InvitationService;
use gatehouse_invitation::store::UserDirectory;
use routes::AppState;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let store = Arc::new(PgInvitationStore::new(db_pool.clone()));
    let directory: Arc<dyn UserDirectory> = Arc::new(PgUserDirectory::new(db_pool));
    let exchange = Arc::new(
        TokenExchangeClient::new(config.provider).expect("failed to build exchange client"),
    );
    let invitations = Arc::new(InvitationService::new(
        store,
        directory.clone(),
        config.invitation,
    ));

    let app = routes::router(AppState {
        invitations,
        directory,
        exchange,
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .await
        .expect("server error");
}
