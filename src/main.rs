//! ethlike-watcher - follows the head of an ETH-like chain
//!
//! Keeps a new heads subscription alive across disconnects, records the
//! latest head on disk and exposes chain and RPC metrics.

use anyhow::{Context, Result};
use ethers::providers::{Provider, Ws};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ethlike_support::cache::TimeCache;
use ethlike_support::chain::{
    BlockCounter, BlockHeader, ChainClient, EthersClient, HeadSubscriber, RateLimitedClient,
    RateLimiter,
};
use ethlike_support::config::{LoggingConfig, Settings};
use ethlike_support::metrics::MetricsServer;
use ethlike_support::persistence::{DiskHandler, PersistenceHandle};
use ethlike_support::subscription::{with_resubscription, ResubscribeOptions, Subscription};
use ethlike_support::tx::NonceManager;

const HEADS_DIRECTORY: &str = "heads";
const LATEST_HEAD: &str = "latest";
const HEAD_BUFFER: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!("Starting ethlike-watcher v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration for chain {}", settings.chain.name);

    let storage = Arc::new(DiskHandler::new(&settings.storage.data_dir));
    for descriptor in storage.read_all().await? {
        if descriptor.directory == HEADS_DIRECTORY && descriptor.name == LATEST_HEAD {
            info!(
                "Last recorded head: {}",
                String::from_utf8_lossy(&descriptor.content)
            );
        }
    }

    // Connect and put every call behind the rate limiter
    let provider = Provider::<Ws>::connect(&settings.chain.ws_url)
        .await
        .with_context(|| format!("Failed to connect to {}", settings.chain.ws_url))?;
    let limiter = Arc::new(RateLimiter::from_config(&settings.rate_limit));
    let client = Arc::new(RateLimitedClient::new(EthersClient::new(provider), limiter));
    info!("Connected to {}", settings.chain.name);

    let shutdown = CancellationToken::new();

    let block_counter = BlockCounter::start(
        client.clone(),
        settings.chain.block_poll_interval(),
        shutdown.child_token(),
    )
    .await?;
    info!("Current block height: {}", block_counter.current_block());

    if let Some(account) = settings.chain.account {
        let mut nonces = NonceManager::new(client.clone(), account);
        match nonces.current_nonce().await {
            Ok(nonce) => info!("Next nonce for {:?}: {}", account, nonce),
            Err(e) => warn!("Failed to reconcile nonce for {:?}: {}", account, e),
        }
        match client.balance_at(account).await {
            Ok(balance) => info!("Balance of {:?}: {} wei", account, balance),
            Err(e) => warn!("Failed to get balance of {:?}: {}", account, e),
        }
    }

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.host.clone(), settings.metrics.port);
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(async move { stop.cancelled().await }).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Keep the new heads subscription alive
    let (heads_tx, heads_rx) = mpsc::channel(HEAD_BUFFER);
    let mut heads_subscription = with_resubscription(
        ResubscribeOptions::from_config(&settings.resubscribe),
        {
            let client = client.clone();
            move |_| {
                let client = client.clone();
                let sink = heads_tx.clone();
                async move { client.subscribe_new_heads(sink).await }
            }
        },
        |elapsed: Duration| warn!("New heads resubscribed after only {:?}", elapsed),
        |e| error!("Failed to subscribe to new heads: {}", e),
    );

    let heads_handle = tokio::spawn(follow_heads(
        heads_rx,
        TimeCache::new(settings.chain.head_dedupe_window()),
        storage.clone(),
    ));

    info!("ethlike-watcher is running");
    if settings.metrics.enabled {
        info!(
            "Metrics: http://{}:{}/metrics",
            settings.metrics.host, settings.metrics.port
        );
    }

    // Wait for shutdown signal or a subscription that cannot be restored
    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received, stopping..."),
        err = heads_subscription.err() => {
            if let Some(e) = err {
                error!("New heads subscription lost: {}", e);
            }
        }
    }

    // Graceful shutdown
    heads_subscription.unsubscribe();
    shutdown.cancel();

    // The sink clones live in the resubscriber, so the follower ends once it stops
    let last_head = match tokio::time::timeout(Duration::from_secs(5), heads_handle).await {
        Ok(Ok(last_head)) => last_head,
        Ok(Err(e)) => {
            error!("Head follower failed: {}", e);
            None
        }
        Err(_) => {
            warn!("Head follower did not stop in time");
            None
        }
    };

    if let Some(head) = last_head {
        match storage
            .snapshot(head.number.to_string().as_bytes(), HEADS_DIRECTORY, LATEST_HEAD)
            .await
        {
            Ok(path) => info!("Snapshotted head {} to {}", head.number, path.display()),
            Err(e) => error!("Failed to snapshot head {}: {}", head.number, e),
        }
    }

    if let Some(h) = metrics_handle {
        let _ = h.await;
    }

    info!(
        "ethlike-watcher stopped at block {}",
        block_counter.current_block()
    );
    Ok(())
}

/// Record every distinct head until the subscription side goes away
async fn follow_heads(
    mut heads: mpsc::Receiver<BlockHeader>,
    seen: TimeCache,
    storage: Arc<DiskHandler>,
) -> Option<BlockHeader> {
    let mut last_head = None;
    let mut sweep = tokio::time::interval(seen.timespan());

    loop {
        tokio::select! {
            _ = sweep.tick() => seen.sweep(),
            header = heads.recv() => {
                let Some(header) = header else { break };

                let key = header
                    .hash
                    .map(|hash| format!("{:?}", hash))
                    .unwrap_or_else(|| header.number.to_string());
                // Resubscribing replays the current head
                if !seen.add(key) {
                    debug!("Skipping duplicate head {}", header.number);
                    continue;
                }

                info!("New head {}", header.number);
                if let Err(e) = storage
                    .save(header.number.to_string().as_bytes(), HEADS_DIRECTORY, LATEST_HEAD)
                    .await
                {
                    error!("Failed to save head {}: {}", header.number, e);
                }
                last_head = Some(header);
            }
        }
    }

    last_head
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .filter
                .as_deref()
                .unwrap_or("info,ethlike_support=debug,ethlike_watcher=debug"),
        )
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
