// Commerce Graph Server

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use commerce_graph::{app_state::AppState, commerce_interface::create_commerce_router, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize application state
    let app_state = AppState::new(config.clone()).await?;

    let app = Router::new()
        .nest("/api/v1", create_commerce_router(app_state.commerce.clone()))
        .layer(CorsLayer::permissive());

    let addr = config.server_address();
    info!("Commerce graph server starting on http://{}", addr);
    info!("  POST   /api/v1/entities/{{entity}}                 - Create entity");
    info!("  GET    /api/v1/entities/{{entity}}                 - List entities");
    info!("  GET    /api/v1/entities/{{entity}}/{{id}}            - Read entity");
    info!("  PUT    /api/v1/entities/{{entity}}/upsert          - Upsert by platformId and channel");
    info!("  GET    /api/v1/entities/{{entity}}/channels/{{channel}}/platform/{{platform_id}}");
    info!("  POST   /api/v1/cache/invalidate                  - Invalidate cached entities");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
