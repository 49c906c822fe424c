use anyhow::Context;

use crmflow_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    crmflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let addr = format!("{}:{}", config.host, config.port);

    let app = crmflow_api::app::build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
