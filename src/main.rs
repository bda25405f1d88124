use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bodega::{
    BucketSettings, Buckets, MemoryOnly, MutationLogger, Result, Server, TapConfig, VBState,
    DEFAULT_BUCKET_NAME,
};

#[derive(Parser)]
#[command(name = "bodega", version)]
#[command(about = "memcached-compatible bucket server with tap streaming")]
struct Cli {
    /// Data protocol listen address
    #[arg(long, default_value = "127.0.0.1:11211")]
    addr: String,

    /// Data directory
    #[arg(long, default_value = "./tmp")]
    data: PathBuf,

    /// Rest protocol listen address (disabled when omitted)
    #[arg(long)]
    rest: Option<String>,

    /// Path to static content, served under /static on the rest address
    #[arg(long)]
    static_path: Option<PathBuf>,

    /// Name of the default bucket; use "" for no default bucket
    #[arg(long, default_value = DEFAULT_BUCKET_NAME)]
    default_bucket_name: String,

    /// Default number of partitions for new buckets
    #[arg(long, default_value_t = 1)]
    default_num_partitions: u16,

    /// Default quota (max key+value bytes allowed) for new buckets
    #[arg(long, default_value_t = 1_000_000)]
    default_quota_bytes: u64,

    /// Default memory-only level for new buckets (0 = everything
    /// persisted; 1 = item ops are not persisted; 2 = nothing persisted)
    #[arg(long, default_value_t = 0)]
    default_memory_only: u8,

    /// Flush interval for new buckets, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    flush_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let settings = BucketSettings {
        num_partitions: cli.default_num_partitions,
        quota_bytes: cli.default_quota_bytes,
        memory_only: MemoryOnly::from_level(cli.default_memory_only),
        flush_interval_ms: cli.flush_interval_ms,
    };

    let logger = MutationLogger::start(1024);

    let buckets = Arc::new(Buckets::new(&cli.data, settings.clone())?);
    let loaded = buckets.load()?;
    info!(loaded, data = %cli.data.display(), "buckets loaded");
    for name in buckets.names() {
        if let Some(bucket) = buckets.get(&name) {
            bucket.subscribe(logger.sender());
        }
    }

    if !cli.default_bucket_name.is_empty() && buckets.get(&cli.default_bucket_name).is_none() {
        info!(
            bucket = %cli.default_bucket_name,
            partitions = settings.num_partitions,
            "creating default bucket"
        );
        let bucket = buckets.create(&cli.default_bucket_name)?;
        bucket.subscribe(logger.sender());
        for vbid in 0..settings.num_partitions {
            bucket.create_vbucket(vbid)?;
            bucket.set_vb_state(vbid, VBState::Active);
        }
        bucket.flush()?;
    }

    if let Some(rest_addr) = cli.rest.clone() {
        let buckets = Arc::clone(&buckets);
        let data_addr = cli.addr.clone();
        let static_path = cli.static_path.clone();
        tokio::spawn(async move {
            if let Err(e) = bodega::rest::serve(rest_addr, static_path, buckets, data_addr).await {
                error!(error = %e, "rest server failed");
            }
        });
    }

    Server::new(
        cli.addr,
        buckets,
        cli.default_bucket_name,
        TapConfig::default(),
    )
    .serve()
    .await
}
