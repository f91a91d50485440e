use fixline::{Engine, EngineConfig};

#[tokio::main]
async fn main() -> fixline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let engine = Engine::bind(EngineConfig::default()).await?;
    engine.run().await
}
