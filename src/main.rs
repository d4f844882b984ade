use axum::Router;
use commonroom::{AppState, auth, blog, conversations, db, donations, fees, library, messages, realtime};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("commonroom=info")),
        )
        .init();

    let db_url = dotenv::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_owned());
    let db_pool = db::connect(&db_url).await?;
    db::init(&db_pool).await?;
    conversations::store::ensure_default_group(&db_pool).await?;

    let state = AppState::new(db_pool);
    state.typing.clone().run_sweeper(state.hub.clone());

    let app = Router::new()
        .nest("/api/conversations", conversations::router())
        .nest("/api/messages", messages::router())
        .nest("/api/users", auth::router())
        .nest("/api/library", library::router())
        .nest("/api/blog", blog::router())
        .nest("/api/fees", fees::router())
        .nest("/api/donations", donations::router())
        .merge(realtime::router())
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr = dotenv::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
