//! Tidings Probe - run one query through the relay and watch it stay fresh.
//!
//! Usage: cargo run --bin tidings-probe -- <query> [dataset] [--with-media]
//!
//! Requires `TIDINGS_PROJECT_ID`. Runs until Ctrl-C, reporting the cached
//! result every time it changes.

use std::future::Future;
use std::time::Duration;

use tidings_core::{QueryResult, TidingsConfig, TidingsResult};
use tidings_sync::{init_tracing, ContentRelay, TelemetryConfig};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> TidingsResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let with_media = args.iter().any(|a| a == "--with-media");
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with("--")).collect();

    let Some(query) = positional.first() else {
        eprintln!("Usage: cargo run --bin tidings-probe -- <query> [dataset] [--with-media]");
        eprintln!();
        eprintln!("Example:");
        eprintln!("  cargo run --bin tidings-probe -- \"*[_type == 'changelog']\" production");
        std::process::exit(1);
    };
    let dataset = positional.get(1).map_or("production", |d| d.as_str());

    let config = TidingsConfig::from_env()?;
    init_tracing(&TelemetryConfig::from_config(&config))?;
    let relay = ContentRelay::from_config(&config)?;

    let last = relay.query(query, dataset, with_media).await?;
    report(&last, relay.is_subscribed(query, dataset));
    if last.is_empty() {
        tracing::info!("Empty result, nothing to keep fresh");
        return Ok(());
    }

    watch(&relay, query, dataset, with_media, last, tokio::signal::ctrl_c()).await;

    let (embedded, referenced) = relay.cache_stats();
    tracing::info!(
        embedded_hit_rate = embedded.hit_rate(),
        referenced_hit_rate = referenced.hit_rate(),
        "Cache statistics"
    );
    relay.shutdown().await;
    Ok(())
}

/// Re-query every [`POLL_INTERVAL`] until `shutdown` resolves, reporting changes.
async fn watch<S: Future>(
    relay: &ContentRelay,
    query: &str,
    dataset: &str,
    with_media: bool,
    mut last: QueryResult,
    shutdown: S,
) {
    tokio::pin!(shutdown);

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                match relay.query(query, dataset, with_media).await {
                    Ok(current) if current != last => {
                        tracing::info!("Result changed");
                        report(&current, relay.is_subscribed(query, dataset));
                        last = current;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(status = e.status, error = %e.message, "Query failed"),
                }
            }
        }
    }
}

fn report(result: &QueryResult, subscribed: bool) {
    println!("{} entries (subscribed: {})", result.len(), subscribed);
    for entry in &result.result {
        println!("  - {} [{}]", entry.title, entry.date.as_deref().unwrap_or("-"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidings_test_utils::{fixtures, ManualFeed, StubFetcher};
    use tidings_upstream::BackendEndpoints;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_slow_query_stops_polling() {
        let fetcher = Arc::new(StubFetcher::new().with_delay(Duration::from_secs(10)));
        let config = fixtures::test_config();
        let relay = ContentRelay::new(
            fetcher.clone(),
            Arc::new(ManualFeed::new()),
            BackendEndpoints::from_config(&config).unwrap(),
            &config,
        );

        // The first poll starts at 5s and is still fetching when shutdown
        // fires at 7s; the loop must stop as soon as that poll returns.
        watch(
            &relay,
            "*[_type=='app']",
            "production",
            false,
            fixtures::empty_result(),
            tokio::time::sleep(Duration::from_secs(7)),
        )
        .await;

        assert_eq!(fetcher.query_calls(), 1);
    }
}
