mod server;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use framecast_core::layer::LayerStore;
use framecast_core::stream_key::{KeyValueStore, MemoryKeyValueStore, RedisKeyValueStore};
use framecast_core::{logging, Config};
use framecast_stream::StreamManager;

#[derive(Parser, Debug)]
#[command(name = "framecast", about = "Live-video production pipeline")]
struct Args {
    /// Path to a config file; environment variables override it.
    #[arg(long, env = "FRAMECAST_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration; validation failures abort startup before
    //    any component is constructed.
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env().unwrap_or_default(),
    };
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Logging.
    logging::init_logging(&config.logging)?;
    info!("framecast starting...");
    info!("RTMP address: {}", config.rtmp_address());
    info!("Preview address: {}", config.preview_address());

    // 3. Stream-key store: durable Redis when configured, in-memory
    //    otherwise.
    let store: Arc<dyn KeyValueStore> = match &config.stream_key.redis_url {
        Some(url) => {
            info!("using redis stream-key store");
            Arc::new(RedisKeyValueStore::connect(url).await?)
        }
        None => {
            info!("using in-memory stream-key store (keys do not survive restart)");
            Arc::new(MemoryKeyValueStore::new())
        }
    };

    // 4. Layer store. Layers arrive through the layer-manager
    //    collaborator at runtime; the store starts empty.
    let layers = Arc::new(LayerStore::new());

    // 5. Wire and start the stream manager.
    let state_sink = Arc::new(server::PreviewStateBroadcast::new());
    let manager = Arc::new(
        StreamManager::initialize(config.clone(), layers, store, state_sink.clone()).await?,
    );
    state_sink.attach(manager.preview());

    manager.start().await?;
    info!(
        "broadcast live; publish endpoint rtmp://{}/{}/<stream-key>",
        config.rtmp_address(),
        config.rtmp.app
    );

    // 6. Preview WebSocket endpoint, serving until shutdown.
    let result = server::serve_preview(config.preview_address(), manager.clone()).await;
    if let Err(e) = &result {
        error!("preview server error: {e}");
    }

    // 7. Reverse-order teardown.
    manager.cleanup();
    info!("framecast stopped");
    result
}
