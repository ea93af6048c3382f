#[tokio::main]
async fn main() {
    use gatepass_access::SessionManager;
    use gatepass_notify::{NatsPublisher, NotificationDispatcher};
    use gatepass_server::{config::ServerConfig, db::PgSessionStore, http};
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

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

    // Connect to the broker and start the notification dispatcher
    let publisher = NatsPublisher::connect(&config.nats)
        .await
        .expect("failed to connect to NATS");
    let (dispatcher, _dispatcher_handle) =
        NotificationDispatcher::start(Arc::new(publisher), config.notifications);

    let store = Arc::new(PgSessionStore::new(db_pool));
    let manager = Arc::new(SessionManager::new(store, dispatcher, config.access.limits));

    // Re-arm expiry timers for sessions opened before a restart
    match manager.restore().await {
        Ok(count) if count > 0 => {
            tracing::info!(restored_sessions = count, "Re-armed expiry timers on startup");
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Failed to restore expiry timers on startup");
        }
    }

    // Spawn periodic overdue-session sweep
    let sweep_manager = manager.clone();
    let sweep_interval_secs = config.access.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(sweep_interval_secs));
        loop {
            interval.tick().await;
            match sweep_manager.expire_overdue().await {
                Ok(count) if count > 0 => {
                    tracing::debug!(expired_sessions = count, "Expired overdue sessions");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to sweep overdue sessions");
                }
            }
        }
    });

    let app = http::router(manager).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.http.bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    tracing::info!("shutdown signal received");
}
