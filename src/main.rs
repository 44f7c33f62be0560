use clap::Parser;
use serde::Serialize;
use shardlist::{
    BatchConsumer, CollectingSink, CollectionConfig, CollectionCoordinator, ConsumerAggregate,
    Element, InMemoryTransport, ItemSink, LocalNodeFactory, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardlist")]
#[command(about = "Sharded list collection demo over an in-memory transport", long_about = None)]
struct Args {
    /// Number of shards (overrides the config file)
    #[arg(short, long)]
    shards: Option<usize>,

    /// Number of integers to add
    #[arg(short, long, default_value_t = 10_000)]
    items: usize,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Serialize)]
struct ShardSummary {
    shard: String,
    count: usize,
}

#[derive(Serialize)]
struct Summary {
    shards: Vec<ShardSummary>,
    added: usize,
    enumerated: usize,
    removed: Option<String>,
    remaining: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardlist=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => CollectionConfig::from_file(path)?,
        None => CollectionConfig::default(),
    };
    if let Some(shards) = args.shards {
        config.initial_shards = shards;
    }
    config.validate()?;

    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let factory = Arc::new(LocalNodeFactory::new(transport.clone(), config.clone()));
    let coordinator = CollectionCoordinator::<i64>::new(factory, config.clone());

    coordinator.set_shard_count(config.initial_shards).await?;
    tracing::info!("Collection ready with {} shards", coordinator.shard_count());

    let references = coordinator
        .batch_add((0..args.items as i64).collect())
        .await?;
    tracing::info!("Added {} items", references.len());

    let sink = Arc::new(CollectingSink::<Element<i64>>::new());
    let aggregate = ConsumerAggregate::subscribe(
        transport.clone(),
        coordinator.output_channels(),
        sink.clone() as Arc<dyn ItemSink<Element<i64>>>,
    )
    .await?;

    let transaction = coordinator.enumerate_to_subscribers(None).await?;
    tokio::time::timeout(
        Duration::from_secs(30),
        aggregate.await_transaction(transaction),
    )
    .await??;
    let enumerated = sink.take().len();
    tracing::info!("Enumerated {} elements", enumerated);

    let removed = match references.first() {
        Some(reference) if coordinator.remove(*reference).await? => Some(reference.to_string()),
        _ => None,
    };

    let mut shards = Vec::new();
    for shard_id in coordinator.shard_ids() {
        shards.push(ShardSummary {
            shard: shard_id.to_string(),
            count: coordinator.count_in(shard_id).await?,
        });
    }

    let summary = Summary {
        shards,
        added: references.len(),
        enumerated,
        removed,
        remaining: coordinator.count().await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    aggregate.tear_down().await?;
    coordinator.tear_down().await?;
    Ok(())
}
