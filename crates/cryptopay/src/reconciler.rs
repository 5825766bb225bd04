use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::ReconcilerConfig;
use crate::ledger::PaymentLedger;
use crate::metrics;
use crate::store::{PaymentRepository, SweepLock};
use crate::types::utc_now;

/// Lease name guarding the sweep across instances sharing a store.
pub const SWEEP_LOCK_NAME: &str = "confirmation_reconciler";

/// Summary of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another instance held the lease; nothing was checked.
    pub skipped: bool,
    pub batches: usize,
    pub checked: usize,
    /// Payments whose stored state changed during the sweep.
    pub changed: usize,
}

/// Periodically re-checks live payments against the chain.
pub struct ConfirmationReconciler {
    ledger: Arc<PaymentLedger>,
    store: Arc<dyn PaymentRepository>,
    lock: Arc<dyn SweepLock>,
    config: ReconcilerConfig,
    confirming_grace: Duration,
    holder: String,
}

impl ConfirmationReconciler {
    pub fn new(
        ledger: Arc<PaymentLedger>,
        store: Arc<dyn PaymentRepository>,
        lock: Arc<dyn SweepLock>,
        config: ReconcilerConfig,
    ) -> Self {
        let minutes = ledger.config().confirming_timeout_minutes.max(0) as u64;
        Self {
            ledger,
            store,
            lock,
            config,
            confirming_grace: Duration::from_secs(minutes * 60),
            holder: Uuid::new_v4().to_string(),
        }
    }

    /// Identify this instance in the lease table.
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Run one full sweep in batches of `batch_size`. Per-payment failures are
    /// absorbed by [`PaymentLedger::check_payment_status`] and never stop the batch.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let ttl = Duration::from_secs(self.config.lock_ttl_secs);

        match self.lock.try_acquire(SWEEP_LOCK_NAME, &self.holder, ttl) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(holder = %self.holder, "reconciliation lease held elsewhere, skipping sweep");
                report.skipped = true;
                return report;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to acquire reconciliation lease");
                report.skipped = true;
                return report;
            }
        }

        let timer = metrics::SWEEP_DURATION.start_timer();
        let batch_size = self.config.batch_size.max(1);
        let mut cursor = 0;

        loop {
            let batch = match self.store.due_for_reconciliation(
                utc_now(),
                self.confirming_grace,
                cursor,
                batch_size,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load reconciliation batch");
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            let full = batch.len() == batch_size;

            for (seq, payment) in batch {
                cursor = seq;
                let updated = self.ledger.check_payment_status(&payment).await;
                report.checked += 1;
                if updated.version != payment.version {
                    report.changed += 1;
                }
            }

            if !full {
                break;
            }
            // Renew the lease between batches; stop if another holder took over.
            match self.lock.try_acquire(SWEEP_LOCK_NAME, &self.holder, ttl) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("reconciliation lease lost mid-sweep, stopping");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to renew reconciliation lease");
                    break;
                }
            }
        }

        timer.observe_duration();
        if let Err(e) = self.lock.release(SWEEP_LOCK_NAME, &self.holder) {
            tracing::warn!(error = %e, "failed to release reconciliation lease");
        }

        tracing::info!(
            batches = report.batches,
            checked = report.checked,
            changed = report.changed,
            "reconciliation sweep finished"
        );
        report
    }

    /// Start the periodic sweep. Ticks missed while a sweep runs are skipped.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }
}
