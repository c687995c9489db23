//! Prometheus metrics for a quorumlog node.
//!
//! This module provides:
//! - Counters and gauges mirrored from edit log and journal set statistics
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Counter, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use quorumlog_core::EditLog;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Prometheus metrics for a quorumlog node.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Transactions appended.
    pub transactions_total: Counter,
    /// Flushes that reached the journals.
    pub syncs_total: Counter,
    /// Transactions that rode along in another caller's sync.
    pub batched_in_sync_total: Counter,
    /// Bytes handed to the journals.
    pub bytes_synced_total: Counter,
    /// Total time spent flushing.
    pub sync_seconds_total: Counter,
    /// Last assigned txid.
    pub last_written_txid: Gauge,
    /// Last durable txid.
    pub synced_txid: Gauge,
    /// Quorum waits that ran out of time.
    pub quorum_timeouts_total: Counter,
    /// 1 while a journal target is excluded from the current segment.
    pub journal_out_of_sync: GaugeVec,
    /// 1 once the edit log has lost durability.
    pub log_poisoned: Gauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Raises `counter` to a cumulative `total` read from the log.
fn advance(counter: &Counter, total: f64) {
    let delta = total - counter.get();
    if delta > 0.0 {
        counter.inc_by(delta);
    }
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transactions_total = counter(
            &registry,
            "quorumlog_transactions_total",
            "Total transactions appended to the edit log",
        )?;
        let syncs_total = counter(
            &registry,
            "quorumlog_syncs_total",
            "Total flushes written to a quorum of journals",
        )?;
        let batched_in_sync_total = counter(
            &registry,
            "quorumlog_batched_in_sync_total",
            "Transactions made durable by another caller's sync",
        )?;
        let bytes_synced_total = counter(
            &registry,
            "quorumlog_bytes_synced_total",
            "Bytes written to the journals",
        )?;
        let sync_seconds_total = counter(
            &registry,
            "quorumlog_sync_seconds_total",
            "Total time spent flushing to the journals",
        )?;
        let last_written_txid = gauge(
            &registry,
            "quorumlog_last_written_txid",
            "Last assigned transaction id",
        )?;
        let synced_txid = gauge(
            &registry,
            "quorumlog_synced_txid",
            "Last durable transaction id",
        )?;
        let quorum_timeouts_total = counter(
            &registry,
            "quorumlog_quorum_timeouts_total",
            "Quorum waits that timed out",
        )?;
        let log_poisoned = gauge(
            &registry,
            "quorumlog_log_poisoned",
            "Whether the edit log lost durability",
        )?;

        let journal_out_of_sync = GaugeVec::new(
            Opts::new(
                "quorumlog_journal_out_of_sync",
                "Journal targets excluded from the current segment",
            ),
            &["target"],
        )?;
        registry.register(Box::new(journal_out_of_sync.clone()))?;

        Ok(Self {
            registry,
            transactions_total,
            syncs_total,
            batched_in_sync_total,
            bytes_synced_total,
            sync_seconds_total,
            last_written_txid,
            synced_txid,
            quorum_timeouts_total,
            journal_out_of_sync,
            log_poisoned,
        })
    }

    /// Copies the current statistics of `log` and its journal set.
    pub fn observe(&self, log: &EditLog) {
        let stats = log.stats();
        advance(&self.transactions_total, stats.transactions as f64);
        advance(&self.syncs_total, stats.syncs as f64);
        advance(&self.batched_in_sync_total, stats.batched_in_sync as f64);
        advance(&self.bytes_synced_total, stats.bytes_synced as f64);
        advance(
            &self.sync_seconds_total,
            stats.sync_time_us as f64 / 1_000_000.0,
        );
        self.last_written_txid.set(stats.last_written_txid as f64);
        self.synced_txid.set(stats.synced_txid as f64);
        self.log_poisoned
            .set(if log.poisoned().is_some() { 1.0 } else { 0.0 });

        let journals = log.journals();
        advance(&self.quorum_timeouts_total, journals.quorum_timeouts() as f64);
        let out_of_sync = journals.out_of_sync_targets();
        for target in journals.target_ids() {
            let value = if out_of_sync.contains(&target) { 1.0 } else { 0.0 };
            self.journal_out_of_sync
                .with_label_values(&[target.as_str()])
                .set(value);
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// The server listens on the given address and serves metrics at `/metrics`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                Bytes::from(body),
            ),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    Bytes::from(e.to_string()),
                )
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", Bytes::from("OK")),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", Bytes::from("Not Found")),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorumlog_core::{EditLogConfig, RecordingFatalHandler};
    use quorumlog_journal::{JournalSet, JournalSetConfig, JournalTarget, MemoryJournal};

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.transactions_total.inc_by(3.0);
        metrics
            .journal_out_of_sync
            .with_label_values(&["j0"])
            .set(1.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("quorumlog_transactions_total 3"));
        assert!(encoded.contains("quorumlog_journal_out_of_sync{target=\"j0\"} 1"));
        assert!(encoded.contains("quorumlog_synced_txid"));
        assert!(encoded.contains("# TYPE quorumlog_transactions_total counter"));
        assert!(encoded.contains("# TYPE quorumlog_synced_txid gauge"));
    }

    #[test]
    fn test_observe_log() {
        let targets: Vec<Arc<dyn JournalTarget>> = (0..3)
            .map(|i| Arc::new(MemoryJournal::new(format!("j{}", i))) as Arc<dyn JournalTarget>)
            .collect();
        let set = Arc::new(JournalSet::new(targets, JournalSetConfig::new(2)).unwrap());
        let log = EditLog::new(set, EditLogConfig::default())
            .with_fatal_handler(Arc::new(RecordingFatalHandler::new()));
        log.init_for_write().unwrap();
        log.open_for_write().unwrap();
        log.append_transaction("op").unwrap();
        log.sync_all().unwrap();

        let metrics = Metrics::new().unwrap();
        metrics.observe(&log);
        assert_eq!(metrics.last_written_txid.get(), 2.0);
        assert_eq!(metrics.synced_txid.get(), 2.0);
        assert_eq!(metrics.syncs_total.get(), 2.0);
        assert_eq!(metrics.log_poisoned.get(), 0.0);

        // Observing again only adds what happened since.
        log.append_transaction("op").unwrap();
        log.sync_all().unwrap();
        metrics.observe(&log);
        metrics.observe(&log);
        assert_eq!(metrics.syncs_total.get(), 3.0);
        assert_eq!(metrics.transactions_total.get(), 3.0);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("quorumlog_journal_out_of_sync{target=\"j2\"} 0"));
    }
}
