//! Optional metrics instrumentation for Coffer.
//!
//! When the `observe` feature is enabled, key operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record a writer save (counter + latency histogram).
///
/// - `coffer.save.total` – counter with `outcome` label
/// - `coffer.save.duration_seconds` – histogram
/// - `coffer.save.objects_total` – objects written
#[inline]
pub fn record_save(duration: std::time::Duration, objects: usize, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("coffer.save.total", "outcome" => outcome).increment(1);
        metrics::histogram!("coffer.save.duration_seconds").record(duration.as_secs_f64());
        metrics::counter!("coffer.save.objects_total").increment(objects as u64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, objects, success);
    }
}

/// Record a reconciliation pass.
///
/// - `coffer.reconcile.runs_total` – counter
/// - `coffer.reconcile.duration_seconds` – histogram
/// - `coffer.reconcile.transactions_total` – history transactions folded
#[inline]
pub fn record_reconcile(duration: std::time::Duration, transactions: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("coffer.reconcile.runs_total").increment(1);
        metrics::histogram!("coffer.reconcile.duration_seconds").record(duration.as_secs_f64());
        metrics::counter!("coffer.reconcile.transactions_total").increment(transactions as u64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, transactions);
    }
}

/// Record one migration step.
///
/// - `coffer.migration.steps_total` – counter with `outcome` label
/// - `coffer.migration.step_duration_seconds` – histogram
#[inline]
pub fn record_migration_step(duration: std::time::Duration, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("coffer.migration.steps_total", "outcome" => outcome).increment(1);
        metrics::histogram!("coffer.migration.step_duration_seconds")
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, success);
    }
}

/// Set the number of live auto-merging contexts.
///
/// - `coffer.contexts.live` – gauge
#[inline]
pub fn set_live_contexts(count: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::gauge!("coffer.contexts.live").set(count as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = count;
    }
}

/// Record a per-store lock wait.
///
/// - `coffer.lock.wait_duration_seconds` – histogram
#[inline]
pub fn record_lock_wait(duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        metrics::histogram!("coffer.lock.wait_duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = duration;
    }
}
