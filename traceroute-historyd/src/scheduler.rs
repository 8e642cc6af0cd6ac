use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use shared::types::{Decision, Destination};
use crate::config::ProbeConfig;
use crate::ingest::Ingestor;
use crate::probe;
use crate::store::Page;

/// Probe loop: every `interval_secs`, traceroute each registered destination
/// and feed the result into the ingestion pipeline.
pub async fn run(
    ingestor: Arc<Ingestor>,
    config: ProbeConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                tokio::select! {
                    result = probe_all(&ingestor, &config) => {
                        if let Err(e) = result {
                            tracing::error!("Probe round failed: {:#}", e);
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!("Scheduler cancelled during probe round");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Scheduler shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// One probe round over all destinations with bounded concurrency.
pub async fn probe_all(ingestor: &Arc<Ingestor>, config: &ProbeConfig) -> Result<()> {
    let lister = ingestor.clone();
    let destinations = tokio::task::spawn_blocking(move || lister.db().list_destinations(Page::default()))
        .await
        .context("Destination listing task failed")??;

    tracing::debug!("Probing {} destinations", destinations.len());

    stream::iter(destinations)
        .for_each_concurrent(config.concurrency.max(1), |destination| async move {
            if let Err(e) = probe_one(ingestor, config, &destination).await {
                tracing::warn!("Probe of {} ({}) failed: {:#}", destination.name, destination.address, e);
            }
        })
        .await;

    Ok(())
}

async fn probe_one(ingestor: &Arc<Ingestor>, config: &ProbeConfig, destination: &Destination) -> Result<Decision> {
    let capture = probe::run_traceroute(config, &destination.address).await?;

    let ingestor = ingestor.clone();
    let destination_id = destination.id;
    let ingestion = tokio::task::spawn_blocking(move || ingestor.ingest(destination_id, &capture))
        .await
        .context("Ingestion task failed")??;

    match ingestion.decision {
        Decision::Stored => tracing::info!(
            "Path to {} changed ({} hops, fingerprint {})",
            destination.name,
            ingestion.entry.hops.len(),
            ingestion.entry.fingerprint
        ),
        Decision::Skipped => tracing::debug!("Path to {} unchanged", destination.name),
    }

    Ok(ingestion.decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{timestamp_now, HistoryDb, HistoryFilter};

    fn echo_config() -> ProbeConfig {
        // echo prints "1 <address>", a single-hop path straight to the target
        ProbeConfig {
            command: "echo".to_string(),
            args: vec!["1".to_string()],
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_probe_round_stores_then_skips() {
        let db = Arc::new(HistoryDb::open(":memory:").unwrap());
        db.create_destination("a", "10.0.0.1", None, timestamp_now()).unwrap();
        db.create_destination("b", "10.0.0.2", None, timestamp_now()).unwrap();
        let ingestor = Arc::new(Ingestor::new(db));
        let config = echo_config();

        probe_all(&ingestor, &config).await.unwrap();
        probe_all(&ingestor, &config).await.unwrap();

        let entries = ingestor
            .db()
            .list_history(HistoryFilter::default(), Page::default())
            .unwrap();
        assert_eq!(entries.len(), 2);

        let mut addresses: Vec<_> = entries
            .iter()
            .map(|e| e.hops[0].address.clone().unwrap())
            .collect();
        addresses.sort();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_probe_failure_does_not_stop_round() {
        let db = Arc::new(HistoryDb::open(":memory:").unwrap());
        let dest = db.create_destination("a", "10.0.0.1", None, timestamp_now()).unwrap();
        let ingestor = Arc::new(Ingestor::new(db));
        let config = ProbeConfig {
            command: "definitely-not-a-traceroute-binary".to_string(),
            ..ProbeConfig::default()
        };

        probe_all(&ingestor, &config).await.unwrap();
        assert!(ingestor.db().latest(dest.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let db = Arc::new(HistoryDb::open(":memory:").unwrap());
        let ingestor = Arc::new(Ingestor::new(db));
        let cancel = CancellationToken::new();
        cancel.cancel();

        run(ingestor, echo_config(), cancel).await.unwrap();
    }
}
