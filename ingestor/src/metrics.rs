use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_messages_total",
        "Total sensor messages received from the bus"
    ))
    .unwrap();
    pub static ref DECODE_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_decode_errors_total",
        "Total messages dropped because the topic or payload could not be decoded"
    ))
    .unwrap();
    pub static ref UNKNOWN_DEVICE_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_unknown_device_total",
        "Total messages dropped because the device is not provisioned"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_readings_persisted_total",
        "Total readings written to the reading store"
    ))
    .unwrap();
    pub static ref INVALID_READINGS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_invalid_readings_total",
        "Total persisted readings outside the device thresholds"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_db_failures_total",
        "Total store operations that failed"
    ))
    .unwrap();
    pub static ref ALERTS_RAISED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("ingestor_alerts_raised_total", "Total alerts raised by kind"),
        &["kind"]
    )
    .unwrap();
    pub static ref PROCESSING_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestor_processing_latency_seconds",
            "Time taken to run one reading through the processing pipeline"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_channel_full_total",
        "Total number of times the ingress channel was full (backpressure events)"
    ))
    .unwrap();
    pub static ref ACTIVE_LANES: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_active_lanes",
        "Number of devices with queued work or a cached anomaly window"
    ))
    .unwrap();
    pub static ref LANE_BACKLOG_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_lane_backlog_total",
        "Total readings queued behind a device lane already holding lane_capacity readings"
    ))
    .unwrap();
    pub static ref LIVENESS_SWEEPS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_liveness_sweeps_total",
        "Total liveness sweeps executed"
    ))
    .unwrap();
    pub static ref OBSERVERS_CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "ingestor_observers_connected",
        "Number of live observers subscribed to farm broadcasts"
    ))
    .unwrap();
    pub static ref OBSERVER_LAGGED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "ingestor_observer_lagged_total",
        "Total broadcast events skipped by observers that fell behind"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY.register(Box::new(MESSAGES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(DECODE_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(UNKNOWN_DEVICE_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(READINGS_PERSISTED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INVALID_READINGS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ALERTS_RAISED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PROCESSING_LATENCY_SECONDS.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CHANNEL_FULL_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(ACTIVE_LANES.clone())).unwrap();
    REGISTRY
        .register(Box::new(LANE_BACKLOG_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(LIVENESS_SWEEPS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OBSERVERS_CONNECTED.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(OBSERVER_LAGGED_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
