use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub dispatch_outcomes_total: IntCounterVec,
    pub notifications_failed_total: IntCounterVec,
    pub sweep_latency_seconds: HistogramVec,
    pub sweep_items_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Offers attempted, by delivery outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let dispatch_outcomes_total = IntCounterVec::new(
            Opts::new(
                "dispatch_outcomes_total",
                "Dispatch transitions by outcome (accepted, rejected, expired, exhausted, ...)",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_outcomes_total metric");

        let notifications_failed_total = IntCounterVec::new(
            Opts::new(
                "notifications_failed_total",
                "Best-effort notifications that could not be delivered",
            ),
            &["channel"],
        )
        .expect("valid notifications_failed_total metric");

        let sweep_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sweep_latency_seconds",
                "Duration of one scheduler sweep in seconds",
            ),
            &["sweep"],
        )
        .expect("valid sweep_latency_seconds metric");

        let sweep_items_total = IntCounterVec::new(
            Opts::new("sweep_items_total", "Items picked up by scheduler sweeps"),
            &["sweep"],
        )
        .expect("valid sweep_items_total metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(dispatch_outcomes_total.clone()))
            .expect("register dispatch_outcomes_total");
        registry
            .register(Box::new(notifications_failed_total.clone()))
            .expect("register notifications_failed_total");
        registry
            .register(Box::new(sweep_latency_seconds.clone()))
            .expect("register sweep_latency_seconds");
        registry
            .register(Box::new(sweep_items_total.clone()))
            .expect("register sweep_items_total");

        for outcome in ["sent", "unreachable"] {
            offers_total.with_label_values(&[outcome]);
        }

        Self {
            registry,
            offers_total,
            dispatch_outcomes_total,
            notifications_failed_total,
            sweep_latency_seconds,
            sweep_items_total,
        }
    }

    pub fn outcome(&self, outcome: &str) {
        self.dispatch_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
