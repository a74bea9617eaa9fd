use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EGRESS_BATCHES_ROTATED: IntCounter = register_int_counter!(
        "piri_egress_batches_rotated_total",
        "egress batches rotated and queued for tracking"
    )
    .unwrap();
    pub static ref EGRESS_JOBS_ENQUEUED: IntCounter = register_int_counter!(
        "piri_egress_jobs_enqueued_total",
        "tracking jobs enqueued"
    )
    .unwrap();
    pub static ref NODE_UP: IntGauge =
        register_int_gauge!("piri_node_up", "1 while the node is running").unwrap();
}

pub fn observe_rotation() {
    EGRESS_BATCHES_ROTATED.inc();
    EGRESS_JOBS_ENQUEUED.inc();
}

/// Render every registered metric in the text exposition format.
pub fn gather() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
