use anyhow::Context;
use tokio::net::TcpListener;

use email_pipeline::api::{self, shutdown_signal};
use email_pipeline::logging;
use email_pipeline::{Pipeline, PipelineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let _log_guard = logging::init(config.log_dir.as_deref());

    eprintln!("📨 Email pipeline v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Bus: {} ({})", config.event_bus_name, config.region);
    eprintln!("   Objects: {} -> {}", config.bucket, config.object_root.display());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Extraction: {}",
        if config.llm.is_some() { "LLM" } else { "keyword" }
    );
    eprintln!("   Matching: {}", config.matching.strategy);
    eprintln!("   API: http://0.0.0.0:{}/api\n", config.api_port);

    let port = config.api_port;
    let pipeline = Pipeline::start(config).await.context("failed to start pipeline")?;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind API port {port}"))?;
    let served = api::serve(listener, api::app(pipeline.api_state()), shutdown_signal()).await;

    pipeline.shutdown().await;
    served.context("API server failed")?;
    Ok(())
}
