use crate::cache::ResponseCache;
use crate::config::{GatewayConfig, ProviderConfig, RuntimeConfig};
use crate::error::{AppError, AppResult};
use crate::logsink::LogSink;
use crate::registry::CapabilityRegistry;
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub registry: CapabilityRegistry,
    pub providers: Arc<HashMap<String, ProviderConfig>>,
    pub http: reqwest::Client,
    pub cache: Arc<ResponseCache>,
    pub logs: LogSink,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    let runtime = RuntimeConfig::from_env();
    let raw = std::fs::read_to_string(&runtime.config_path).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "config_read_failed",
            format!("{}: {}", runtime.config_path, err),
        )
    })?;
    let config: GatewayConfig = serde_json::from_str(&raw).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "config_parse_failed",
            err.to_string(),
        )
    })?;
    load_state_with(runtime, config).await
}

pub async fn load_state_with(runtime: RuntimeConfig, config: GatewayConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("omnirelay/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let registry = CapabilityRegistry::new();
    registry.replace_records(config.models).await;

    let providers: HashMap<String, ProviderConfig> = config
        .providers
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let cache = Arc::new(ResponseCache::new(
        Duration::from_secs(runtime.cache_ttl_secs),
        runtime.cache_disabled,
    ));
    if !runtime.cache_disabled {
        let sweep_cache = cache.clone();
        let period = Duration::from_secs(runtime.cache_ttl_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                sweep_cache.sweep_expired();
            }
        });
    }

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        registry,
        providers: Arc::new(providers),
        http,
        cache,
        logs: LogSink::spawn(),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder unavailable",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/metrics", get(crate::handlers::metrics))
        .route("/healthz", get(crate::handlers::healthz))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
