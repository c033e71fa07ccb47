//! Prometheus metrics for the settlement engine
//!
//! Exposed on the /metrics endpoint of the status listener.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Matcher metrics
    pub static ref BRIDGE_ROWS_BUILT: CounterVec = register_counter_vec!(
        "settler_bridge_rows_built_total",
        "Bridge transactions created by the source sweep",
        &["chain"]
    ).unwrap();

    pub static ref BRIDGE_ROWS_CLOSED: CounterVec = register_counter_vec!(
        "settler_bridge_rows_closed_total",
        "Bridge transactions closed by the destination sweep",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref EVALUATION_ERRORS: CounterVec = register_counter_vec!(
        "settler_evaluation_errors_total",
        "Deposits that failed payout derivation",
        &["chain"]
    ).unwrap();

    pub static ref SWEEP_ERRORS: CounterVec = register_counter_vec!(
        "settler_sweep_errors_total",
        "Matcher sweep failures",
        &["sweep"]
    ).unwrap();

    // Sequencer metrics
    pub static ref PAYOUTS_BROADCAST: CounterVec = register_counter_vec!(
        "settler_payouts_broadcast_total",
        "Payout transactions broadcast",
        &["chain", "mode"]
    ).unwrap();

    pub static ref PAYOUTS_CRASHED: CounterVec = register_counter_vec!(
        "settler_payouts_crashed_total",
        "Payouts that failed after a possible broadcast side effect",
        &["chain"]
    ).unwrap();

    pub static ref PAYOUT_ERRORS: CounterVec = register_counter_vec!(
        "settler_payout_errors_total",
        "Payout failures by error kind",
        &["kind"]
    ).unwrap();

    // Queue sizes
    pub static ref INFLIGHT_PAYOUTS: GaugeVec = register_gauge_vec!(
        "settler_inflight_payouts",
        "Queued payout tasks awaiting scheduling",
        &["chain"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "settler_up",
        "Whether the settlement engine is up and running"
    ).unwrap();
}
