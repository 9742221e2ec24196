use crate::models::Stats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// In-process counters for voucher and settlement outcomes.
pub struct Analytics {
    vouchers_verified: AtomicU64,
    vouchers_rejected: AtomicU64,
    settlements_confirmed: AtomicU64,
    settlements_reverted: AtomicU64,
    settlements_failed: AtomicU64,
    reconciliations_required: AtomicU64,
    vouchers_settled: AtomicU64,
    start_time: Instant,
}

impl Default for Analytics {
    fn default() -> Self {
        Self::new()
    }
}

impl Analytics {
    pub fn new() -> Self {
        Self {
            vouchers_verified: AtomicU64::new(0),
            vouchers_rejected: AtomicU64::new(0),
            settlements_confirmed: AtomicU64::new(0),
            settlements_reverted: AtomicU64::new(0),
            settlements_failed: AtomicU64::new(0),
            reconciliations_required: AtomicU64::new(0),
            vouchers_settled: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_verified(&self) {
        self.vouchers_verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.vouchers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_settled(&self, voucher_count: usize) {
        self.settlements_confirmed.fetch_add(1, Ordering::Relaxed);
        self.vouchers_settled
            .fetch_add(voucher_count as u64, Ordering::Relaxed);
    }

    pub fn record_reverted(&self) {
        self.settlements_reverted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.settlements_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconciliation(&self) {
        self.reconciliations_required.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            vouchers_verified: self.vouchers_verified.load(Ordering::Relaxed),
            vouchers_rejected: self.vouchers_rejected.load(Ordering::Relaxed),
            settlements_confirmed: self.settlements_confirmed.load(Ordering::Relaxed),
            settlements_reverted: self.settlements_reverted.load(Ordering::Relaxed),
            settlements_failed: self.settlements_failed.load(Ordering::Relaxed),
            reconciliations_required: self.reconciliations_required.load(Ordering::Relaxed),
            vouchers_settled: self.vouchers_settled.load(Ordering::Relaxed),
            uptime_seconds: self.uptime_seconds(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let analytics = Analytics::new();
        analytics.record_verified();
        analytics.record_verified();
        analytics.record_rejected();
        analytics.record_settled(2);
        analytics.record_reverted();

        let stats = analytics.get_stats();
        assert_eq!(stats.vouchers_verified, 2);
        assert_eq!(stats.vouchers_rejected, 1);
        assert_eq!(stats.settlements_confirmed, 1);
        assert_eq!(stats.vouchers_settled, 2);
        assert_eq!(stats.settlements_reverted, 1);
        assert_eq!(stats.settlements_failed, 0);
    }
}
