use anyhow::Result;
use clap::Parser;
use fanout::config::Config;
use fanout::executor::Executor;
use fanout::notifier::{Callback, Event};
use fanout::transport::TransportRegistry;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let config = Config::parse();

    // Initialize tracing subscriber; RUST_LOG overrides -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("fanout v{} starting...", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let invocation_id = Uuid::new_v4();
    info!("Invocation {}", invocation_id);

    let mut inventory = config.load_inventory()?;
    let targets = inventory.get_targets(&config.targets)?;
    let (action, options) = config.action()?;

    let executor = Executor::new(
        config.executor_config(),
        Arc::new(TransportRegistry::with_defaults()),
    );

    let callback: Callback = Arc::new(move |event: Event| {
        debug!(
            "[{}] {} on {}",
            invocation_id,
            event.kind(),
            event.target().name()
        );
    });
    let results = executor
        .dispatch(&targets, action, options, Some(callback))
        .await;

    println!("{}", serde_json::to_string_pretty(&results)?);

    if !results.ok() {
        anyhow::bail!(
            "{} of {} targets failed",
            results.error_set().len(),
            results.len()
        );
    }

    Ok(())
}
