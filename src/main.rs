use omnirelay::app;
use omnirelay::error::AppError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,omnirelay=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();

    if let Err(err) = serve().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn serve() -> Result<(), AppError> {
    let state = app::load_state().await?;
    let listen = state.runtime.listen.clone();
    let models = state.registry.all_records().await.len();
    let providers = state.providers.len();

    let router = app::build_app(state);
    let listener = tokio::net::TcpListener::bind(&listen).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            format!("{listen}: {err}"),
        )
    })?;
    info!(listen = %listen, providers, models, "gateway up");
    axum::serve(listener, router).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })
}
