use crate::cache::{now_secs, SampleCache};
use crate::derivation::DerivationEngine;
use crate::threshold::ThresholdEngine;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const READ_CHUNK_SIZE: usize = 4096;
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared pipeline the Collector Listener feeds into: parse (C4), evaluate
/// (C3), cache (C2). One instance is constructed in `main` and cloned into
/// every connection task.
#[derive(Clone)]
pub struct IngestPipeline {
    pub derivation: Arc<DerivationEngine>,
    pub threshold: Arc<ThresholdEngine>,
    pub cache: Arc<SampleCache>,
    pub last_line_seen: Arc<AtomicU64>,
}

impl IngestPipeline {
    /// Feed one collector line through derivation, caching and threshold
    /// evaluation, returning the samples that should go to the Publisher.
    pub fn ingest_line(&self, line: &str) -> Vec<crate::model::MetricSample> {
        self.last_line_seen
            .store(now_secs().to_bits(), Ordering::Relaxed);

        let mut parsed = Vec::new();
        self.derivation.feed_line(line, &self.cache, &mut parsed);
        self.cache_and_evaluate(parsed)
    }

    /// Attempt every queued derived-metric computation now, independent of
    /// tick detection. Called at end-of-batch (§4.4) so a connection's final
    /// aggregates aren't stranded until a later batch advances the clock.
    pub fn drain_pending(&self) -> Vec<crate::model::MetricSample> {
        let mut parsed = Vec::new();
        self.derivation.drain_pending(&self.cache, &mut parsed);
        self.cache_and_evaluate(parsed)
    }

    fn cache_and_evaluate(&self, parsed: Vec<crate::model::MetricSample>) -> Vec<crate::model::MetricSample> {
        let mut evaluated = Vec::with_capacity(parsed.len() * 2);
        for sample in parsed {
            self.cache.put(sample.clone());
            let (sample, status_sample) = self.threshold.evaluate(sample, true);
            evaluated.push(sample);
            if let Some(status_sample) = status_sample {
                evaluated.push(status_sample);
            }
        }
        evaluated
    }

    /// Seconds since the last collector line was observed, for the
    /// graphite-idle watchdog (§7).
    pub fn seconds_since_last_line(&self) -> f64 {
        let bits = self.last_line_seen.load(Ordering::Relaxed);
        now_secs() - f64::from_bits(bits)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerStats {
    pub connections_accepted: usize,
    pub lines_processed: usize,
}

#[derive(Default)]
struct AtomicListenerStats {
    connections_accepted: AtomicUsize,
    lines_processed: AtomicUsize,
}

impl AtomicListenerStats {
    fn snapshot(&self) -> ListenerStats {
        ListenerStats {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            lines_processed: self.lines_processed.load(Ordering::Relaxed),
        }
    }
}

/// Binds the collector TCP listener and serves connections until
/// `shutdown` fires, matching the teacher's 1-second poll pattern so the
/// terminating flag is observed promptly (§4.5, §5).
pub async fn run_listener(
    bind_addr: std::net::SocketAddr,
    pipeline: IngestPipeline,
    mut shutdown: watch::Receiver<bool>,
    sample_tx: tokio::sync::mpsc::Sender<Vec<crate::model::MetricSample>>,
) -> std::io::Result<ListenerStats> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "collector listener bound");

    let stats = Arc::new(AtomicListenerStats::default());
    let mut tasks = tokio::task::JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let accept_fut = listener.accept();
        tokio::select! {
            accepted = accept_fut => {
                match accepted {
                    Ok((stream, peer)) => {
                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(peer = %peer, "collector connection accepted");
                        let pipeline = pipeline.clone();
                        let stats = stats.clone();
                        let sample_tx = sample_tx.clone();
                        let mut conn_shutdown = shutdown.clone();
                        tasks.spawn(async move {
                            tokio::select! {
                                n = serve_connection(stream, pipeline, &stats, sample_tx) => {
                                    if let Err(err) = n {
                                        tracing::debug!(peer = %peer, error = %err, "collector connection closed with error");
                                    }
                                }
                                _ = conn_shutdown.changed() => {}
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "collector accept failed");
                    }
                }
            }
            _ = tokio::time::sleep(ACCEPT_TIMEOUT) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}

    Ok(stats.snapshot())
}

async fn serve_connection(
    mut stream: TcpStream,
    pipeline: IngestPipeline,
    stats: &AtomicListenerStats,
    sample_tx: tokio::sync::mpsc::Sender<Vec<crate::model::MetricSample>>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut partial = String::new();

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        partial.push_str(&String::from_utf8_lossy(&buf[..n]));

        while let Some(pos) = partial.find('\n') {
            let line = partial[..pos].trim_end_matches('\r').to_string();
            partial.drain(..=pos);

            if line.is_empty() {
                continue;
            }

            stats.lines_processed.fetch_add(1, Ordering::Relaxed);
            let samples = pipeline.ingest_line(&line);
            if !samples.is_empty() && sample_tx.send(samples).await.is_err() {
                return Ok(());
            }
        }

        // end-of-batch: resolve whatever derived metrics are now ready
        // rather than waiting for a later batch's tick to advance (§4.4)
        let derived = pipeline.drain_pending();
        if !derived.is_empty() && sample_tx.send(derived).await.is_err() {
            return Ok(());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Threshold;
    use std::collections::HashMap;

    fn pipeline() -> IngestPipeline {
        IngestPipeline {
            derivation: Arc::new(DerivationEngine::new(Vec::new(), None, &[], Vec::new())),
            threshold: Arc::new(ThresholdEngine::new(HashMap::<crate::model::ThresholdKey, Threshold>::new())),
            cache: Arc::new(SampleCache::new()),
            last_line_seen: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn ingest_line_updates_watchdog_clock() {
        let pipeline = pipeline();
        assert!(pipeline.seconds_since_last_line() > 0.0);
        pipeline.ingest_line("host.load.longterm 1.0 1000");
        assert!(pipeline.seconds_since_last_line() < 5.0);
    }

    #[test]
    fn ingest_line_drops_unparseable_input() {
        let pipeline = pipeline();
        let samples = pipeline.ingest_line("garbage");
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn listener_accepts_and_feeds_lines() {
        let pipeline = pipeline();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (sample_tx, mut sample_rx) = tokio::sync::mpsc::channel(16);

        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(addr).await.unwrap();
        let bound_addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(run_listener(bound_addr, pipeline, shutdown_rx, sample_tx));

        // give the listener a moment to bind before connecting
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(bound_addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        stream.write_all(b"host.load.longterm 1.5 1000\n").await.unwrap();
        drop(stream);

        let samples = tokio::time::timeout(Duration::from_secs(2), sample_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(samples[0].measurement, "system_load15");

        shutdown_tx.send(true).unwrap();
        let stats = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.connections_accepted, 1);
    }
}
