//! OpenTelemetry instruments for the RoleBinding sync loop
//!
//! Instruments are no-ops until a meter provider is installed by
//! [`crate::telemetry::init_telemetry`].

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("clusterset_rbac"));

/// Histogram of full reconciliation pass duration (both roles)
pub static SYNC_PASS_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("clusterset_rbac_sync_pass_duration_seconds")
        .with_description("Duration of a full RoleBinding reconciliation pass in seconds")
        .with_unit("s")
        .build()
});

/// Counter of per-binding outcomes
///
/// Labels:
/// - `role`: admin, view
/// - `outcome`: created, updated, recreated, unchanged, deleted
pub static BINDING_OUTCOMES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterset_rbac_binding_outcomes_total")
        .with_description("RoleBinding apply/delete outcomes")
        .with_unit("{bindings}")
        .build()
});

/// Counter of failed object-store operations
///
/// Labels:
/// - `role`: admin, view
/// - `action`: apply, delete, list
pub static SYNC_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("clusterset_rbac_sync_errors_total")
        .with_description("Failed RoleBinding operations")
        .with_unit("{errors}")
        .build()
});

/// Gauge of namespaces that should carry a binding
///
/// Labels:
/// - `role`: admin, view
pub static DESIRED_NAMESPACES: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("clusterset_rbac_desired_namespaces")
        .with_description("Namespaces with a desired RoleBinding in the last pass")
        .with_unit("{namespaces}")
        .build()
});

/// Record one binding outcome
pub fn record_outcome(role: &'static str, outcome: &'static str) {
    BINDING_OUTCOMES.add(
        1,
        &[
            KeyValue::new("role", role),
            KeyValue::new("outcome", outcome),
        ],
    );
}

/// Record one failed operation
pub fn record_error(role: &'static str, action: &'static str) {
    SYNC_ERRORS.add(
        1,
        &[KeyValue::new("role", role), KeyValue::new("action", action)],
    );
}

/// Record the size of the desired state for a role
pub fn record_desired(role: &'static str, namespaces: usize) {
    DESIRED_NAMESPACES.record(namespaces as u64, &[KeyValue::new("role", role)]);
}
