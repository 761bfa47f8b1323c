use std::sync::atomic::{AtomicU64, Ordering};

/// Scale factor applied to per-message charges before dividing by weight, so
/// integer accounting keeps resolution across weight ratios.
pub const CHARGE_SCALE: u64 = 100;

/// Per-queue accumulator of served work used by the weighted-fair policy.
#[derive(Debug, Default)]
pub struct SchedulingAccount {
    queued: AtomicU64,
    served: AtomicU64,
    charged: AtomicU64,
}

impl SchedulingAccount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_enqueued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Charge one served message proportionally to its cost and inversely to
    /// the flow's weight.
    pub fn on_served(&self, cost: u64, weight: u32) {
        self.served.fetch_add(1, Ordering::Relaxed);
        let charge = cost.saturating_mul(CHARGE_SCALE) / u64::from(weight.max(1));
        self.charged.fetch_add(charge, Ordering::Relaxed);
    }

    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn charged(&self) -> u64 {
        self.charged.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charges_scale_inversely_with_weight() {
        let account = SchedulingAccount::new();
        account.on_enqueued();
        account.on_served(1, 10);
        account.on_served(1, 20);
        assert_eq!(account.queued(), 1);
        assert_eq!(account.served(), 2);
        assert_eq!(account.charged(), CHARGE_SCALE / 10 + CHARGE_SCALE / 20);
    }

    #[test]
    fn zero_weight_is_treated_as_one() {
        let account = SchedulingAccount::new();
        account.on_served(3, 0);
        assert_eq!(account.charged(), 3 * CHARGE_SCALE);
    }
}
