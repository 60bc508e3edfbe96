use axum::{
    routing::{delete, get, post},
    Router,
};
use deepsearch_agent::{
    AgentConfig, HttpScraper, MemoryKv, ResultCache, ResumableStreams, RunSession,
    RunSessionParams, SerperSearch,
};
use deepsearch_llm::{OpenAICompatModel, OpenAICompatModelOptions};
use dotenvy::dotenv;
use std::{env, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod auth;
mod routes;
mod store;

use auth::StaticTokenAuth;
use routes::AppState;
use store::MemoryChatStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AgentConfig::from_env();
    let http = reqwest::Client::builder()
        .user_agent("deepsearch/0.1")
        .build()?;

    let model = Arc::new(OpenAICompatModel::new(
        env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
        OpenAICompatModelOptions {
            base_url: env::var("LLM_BASE_URL").ok(),
            api_key: env::var("LLM_API_KEY").unwrap_or_default(),
            client: Some(http.clone()),
        },
    ));

    let search = Arc::new(SerperSearch::from_env(http.clone())?);

    // The key-value store is an external collaborator; the in-process
    // implementation serves single-node deployments.
    let kv = Arc::new(MemoryKv::new());
    let scrape_cache = ResultCache::new(kv.clone(), config.cache_ttl);
    let scraper = Arc::new(HttpScraper::new(
        http,
        scrape_cache,
        config.scrape_max_retries,
    ));

    let streams = Arc::new(ResumableStreams::new(kv.clone(), config.request_timeout));

    let session = Arc::new(RunSession::new(RunSessionParams {
        config,
        model,
        search,
        scraper,
        kv,
    }));

    let state = AppState {
        session,
        auth: Arc::new(StaticTokenAuth::from_env()),
        chats: Arc::new(MemoryChatStore::new()),
        streams,
    };

    let app_url = env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let app = Router::new()
        .route("/", get(routes::home))
        .route("/chat", post(routes::post_chat).get(routes::resume_chat))
        .route("/chat/{id}", delete(routes::delete_chat))
        .layer(
            CorsLayer::new()
                .allow_origin([app_url.parse()?])
                .allow_methods(["GET", "POST", "DELETE", "OPTIONS"].map(|m| m.parse().unwrap()))
                .allow_headers(["content-type", "authorization"].map(|h| h.parse().unwrap()))
                .allow_credentials(true),
        )
        .with_state(state);

    let port = env::var("PORT").unwrap_or_else(|_| "4000".to_string());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!(%port, "deepsearch server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
