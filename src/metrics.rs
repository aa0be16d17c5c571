use prometheus::{opts, Counter, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub subscribers: Gauge,
    pub poll_starts_total: Counter,
    pub ticks_total: Counter,
    pub sample_errors_total: Counter,
    pub snapshots_delivered_total: Counter,
    pub log_sources: Gauge,
    pub log_scan_errors_total: Counter,
    pub scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let subscribers = Gauge::with_opts(opts!(
            "hostpulse_subscribers",
            "Number of currently registered broadcast subscribers"
        ))?;
        let poll_starts_total = Counter::with_opts(opts!(
            "hostpulse_poll_starts_total",
            "Times a polling task has been started"
        ))?;
        let ticks_total = Counter::with_opts(opts!(
            "hostpulse_ticks_total",
            "Polling ticks executed, including skipped ones"
        ))?;
        let sample_errors_total = Counter::with_opts(opts!(
            "hostpulse_sample_errors_total",
            "Ticks skipped because the metrics provider failed"
        ))?;
        let snapshots_delivered_total = Counter::with_opts(opts!(
            "hostpulse_snapshots_delivered_total",
            "Snapshot deliveries to individual subscribers"
        ))?;
        let log_sources = Gauge::with_opts(opts!(
            "hostpulse_log_sources",
            "Log sources found by the most recent aggregation"
        ))?;
        let log_scan_errors_total = Counter::with_opts(opts!(
            "hostpulse_log_scan_errors_total",
            "Failed log directory scans"
        ))?;
        let scrape_count_total = Counter::with_opts(opts!(
            "hostpulse_scrape_count_total",
            "Prometheus scrapes served"
        ))?;

        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(poll_starts_total.clone()))?;
        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(sample_errors_total.clone()))?;
        registry.register(Box::new(snapshots_delivered_total.clone()))?;
        registry.register(Box::new(log_sources.clone()))?;
        registry.register(Box::new(log_scan_errors_total.clone()))?;
        registry.register(Box::new(scrape_count_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            subscribers,
            poll_starts_total,
            ticks_total,
            sample_errors_total,
            snapshots_delivered_total,
            log_sources,
            log_scan_errors_total,
            scrape_count_total,
        }))
    }

    pub fn encode_metrics(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }

    pub fn inc_scrape_count(&self) {
        self.scrape_count_total.inc();
    }
}
