//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{analysis_llm::OpenAiAnalysisAdapter, db::DbAdapter, video::MeetRoomAdapter},
    config::Config,
    error::ApiError,
    web::{
        auth::{login_handler, logout_handler, signup_handler},
        cancel_session_handler, create_session_handler, end_session_handler, get_session_handler,
        list_sessions_handler, mark_ready_handler,
        middleware::{rate_limit_monitor, require_auth},
        monitor_session_handler,
        sessions::ApiDoc,
        state::AppState,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use skillswap_core::engine::{EngineConfig, SessionEngine};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let openai_client = Client::with_config(openai_config);

    let analysis_adapter = Arc::new(OpenAiAnalysisAdapter::new(
        openai_client,
        config.analysis_model.clone(),
        Duration::from_secs(config.oracle_timeout_secs),
    ));
    let room_adapter = Arc::new(MeetRoomAdapter::new(config.video_base_url.clone()));

    // --- 4. Build the Engine and Shared AppState ---
    let engine = Arc::new(SessionEngine::new(
        db_adapter.clone(),
        db_adapter.clone(),
        analysis_adapter,
        room_adapter,
        db_adapter.clone(),
        EngineConfig {
            session_fee_tokens: config.session_fee_tokens,
            reputation_increment: config.reputation_increment,
            room_ttl_minutes: config.room_ttl_minutes,
        },
    ));

    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        store: db_adapter,
        config: config.clone(),
    });

    // --- 5. Start the Abandoned-Session Sweep ---
    let sweep_engine = engine.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    let max_age = chrono::Duration::minutes(config.session_max_age_minutes);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_engine.sweep_abandoned(max_age).await {
                warn!(error = %e, "abandoned-session sweep failed");
            }
        }
    });

    let cors = CorsLayer::new()
        .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // --- 6. Create the Web Router ---
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler));

    // The monitor endpoint carries its own rate limit on top of auth.
    let monitor_routes = Router::new()
        .route("/sessions/{session_id}/monitor", post(monitor_session_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            rate_limit_monitor,
        ));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/sessions", post(create_session_handler).get(list_sessions_handler))
        .route("/sessions/{session_id}", get(get_session_handler))
        .route("/sessions/{session_id}/ready", put(mark_ready_handler))
        .route("/sessions/{session_id}/end", post(end_session_handler))
        .route("/sessions/{session_id}/cancel", post(cancel_session_handler))
        .merge(monitor_routes)
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    // Combine API routes
    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
