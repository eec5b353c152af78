mod config;
mod db;
mod frame;
mod routes;
mod services;
mod state;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::Config::from_env();
    let store = db::open_store(config.database_url.as_deref()).await;

    let document = services::document::SharedDocument::load_initial(store.as_ref()).await;
    let state = state::AppState::new(store, document, config.sync);

    // Spawn background idle-turn sweeper.
    let _sweeper = services::turn::spawn_turn_sweeper(state.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "syncboard listening");
    axum::serve(listener, app).await.expect("server failed");
}
