use dataframe_chat_service::{ServiceConfig, create_app, telemetry::init_tracing};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    init_tracing(config.log_format);

    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let app = create_app(&config);
    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let addr = listener.local_addr()?;

    info!(
        provider = ?config.provider,
        model = %config.model,
        upload_dir = %config.upload_dir.display(),
        "Dataframe Chat Service starting on {}",
        addr
    );
    info!("API Documentation available at http://{}/", addr);
    info!("Health check endpoint: http://{}/health", addr);
    info!("Open a session: POST http://{}/sessions", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
