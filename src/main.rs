use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

mod config;
mod matching;
mod models;
mod news;
mod pipeline;
mod providers;
mod record;
mod schema;
mod urlnorm;

use config::Config;
use models::{NewsRequest, SearchRequest, SearchResponse};
use news::{NewsError, NewsReader};
use pipeline::{Pipeline, PipelineError};
use providers::{
    Extractor, GeminiModel, GoogleSearchProvider, HttpPageFetcher, LanguageModel, LlmExtractor,
    PageFetcher, SearchProvider, SpeechSynthesizer, TranslateTts,
};

struct AppState {
    config: Config,
    llm: Arc<dyn LanguageModel>,
    extractor: Arc<dyn Extractor>,
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    tts: Arc<dyn SpeechSynthesizer>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let llm: Arc<dyn LanguageModel> = match GeminiModel::new(
        config.google_api_key.clone(),
        config.gemini_model.clone(),
    ) {
        Ok(model) => Arc::new(model),
        Err(e) => {
            tracing::error!("failed to build model client: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        extractor: Arc::new(LlmExtractor::new(
            llm.clone(),
            Duration::from_secs(config.fetch_timeout_secs),
        )),
        search: Arc::new(GoogleSearchProvider),
        fetcher: Arc::new(HttpPageFetcher),
        tts: Arc::new(TranslateTts),
        llm,
        config,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/search", post(search_endpoint))
        .route("/news", post(news_endpoint))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .unwrap();
    tracing::info!("listening on {}", listener.local_addr().unwrap());
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn search_endpoint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "query must not be empty"})),
        )
            .into_response();
    }

    let pipeline = Pipeline {
        extractor: state.extractor.as_ref(),
        search: state.search.as_ref(),
        llm: state.llm.as_ref(),
        config: state.config.pipeline_config(&req.query, req.num_results),
    };

    match pipeline.run(&req.query).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(SearchResponse {
                results: outcome.records,
                partial: outcome.partial,
                warning: outcome.warning,
            }),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                PipelineError::NoCandidates => StatusCode::NOT_FOUND,
                PipelineError::Discovery(_) => StatusCode::BAD_GATEWAY,
                PipelineError::FatalTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            };
            (status, Json(json!({"detail": e.to_string()}))).into_response()
        }
    }
}

async fn news_endpoint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewsRequest>,
) -> Response {
    let reader = NewsReader {
        extractor: state.extractor.as_ref(),
        fetcher: state.fetcher.as_ref(),
        llm: state.llm.as_ref(),
        tts: state.tts.as_ref(),
        config: state.config.news_config(),
    };
    let lang = req.voice_lang.as_deref().unwrap_or("en");

    match reader.read_latest(&req.site_url, lang).await {
        Ok(audio) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "audio/mpeg")],
            audio,
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                NewsError::NoSummaries { .. } => StatusCode::NOT_FOUND,
                NewsError::FatalTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                NewsError::Speech(_) => StatusCode::BAD_GATEWAY,
            };
            (status, Json(json!({"detail": e.to_string()}))).into_response()
        }
    }
}
