use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus metrics for the manager
pub struct ManagerMetrics {
    pub registry: Registry,

    // Submissions by outcome (accepted / rejected)
    pub submissions_total: IntCounterVec,

    pub items_executed_total: IntCounter,
    pub item_failures_total: IntCounter,

    // Drain cycles currently holding a thread
    pub workers_active: IntGauge,

    pub terminations_total: IntCounter,
}

impl ManagerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let submissions_total = IntCounterVec::new(
            Opts::new("kx_submissions_total", "Work item submissions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let items_executed_total = IntCounter::new(
            "kx_items_executed_total",
            "Work items taken off a queue and executed",
        )?;
        registry.register(Box::new(items_executed_total.clone()))?;

        let item_failures_total = IntCounter::new(
            "kx_item_failures_total",
            "Failed action invocations captured by workers",
        )?;
        registry.register(Box::new(item_failures_total.clone()))?;

        let workers_active = IntGauge::new("kx_workers_active", "Number of running key workers")?;
        registry.register(Box::new(workers_active.clone()))?;

        let terminations_total =
            IntCounter::new("kx_terminations_total", "Keys aborted by terminate")?;
        registry.register(Box::new(terminations_total.clone()))?;

        Ok(ManagerMetrics {
            registry,
            submissions_total,
            items_executed_total,
            item_failures_total,
            workers_active,
            terminations_total,
        })
    }

    pub fn inc_submissions(&self, outcome: &str) {
        self.submissions_total.with_label_values(&[outcome]).inc();
    }

    /// Record one executed item and the failures it captured
    pub fn observe_item(&self, failures: usize) {
        self.items_executed_total.inc();
        self.item_failures_total.inc_by(failures as u64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather_text(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
