//! Maximum drawdown tracking.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::warn;

use crate::utils::decimal::safe_div;

/// Tracks drawdown of strategy equity from its running peak.
#[derive(Debug, Clone)]
pub struct DrawdownTracker {
    /// Maximum allowed drawdown in percent (5 = 5%)
    max_drawdown_pct: Decimal,
    peak_equity: Decimal,
    current_drawdown_pct: Decimal,
    /// Worst drawdown this session, in percent
    session_mdd_pct: Decimal,
}

impl DrawdownTracker {
    pub fn new(max_drawdown_pct: Decimal, initial_equity: Decimal) -> Self {
        Self {
            max_drawdown_pct,
            peak_equity: initial_equity,
            current_drawdown_pct: Decimal::ZERO,
            session_mdd_pct: Decimal::ZERO,
        }
    }

    /// Update with new equity value.
    ///
    /// Returns true if drawdown reached the maximum allowed.
    pub fn update(&mut self, equity: Decimal) -> bool {
        if equity > self.peak_equity {
            self.peak_equity = equity;
            self.current_drawdown_pct = Decimal::ZERO;
        } else {
            self.current_drawdown_pct =
                safe_div(self.peak_equity - equity, self.peak_equity) * dec!(100);

            if self.current_drawdown_pct > self.session_mdd_pct {
                self.session_mdd_pct = self.current_drawdown_pct;
                warn!(
                    mdd_pct = %self.session_mdd_pct,
                    peak = %self.peak_equity,
                    current = %equity,
                    "New maximum drawdown recorded"
                );
            }
        }

        self.exceeds_limit()
    }

    pub fn exceeds_limit(&self) -> bool {
        self.current_drawdown_pct >= self.max_drawdown_pct
    }

    pub fn current_drawdown_pct(&self) -> Decimal {
        self.current_drawdown_pct
    }

    pub fn session_mdd_pct(&self) -> Decimal {
        self.session_mdd_pct
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    /// Check if we're approaching the max drawdown threshold.
    ///
    /// Returns (is_warning, distance_to_max)
    pub fn warning_check(&self) -> (bool, Decimal) {
        let distance = self.max_drawdown_pct - self.current_drawdown_pct;
        let warning_threshold = self.max_drawdown_pct * dec!(0.2);

        (distance <= warning_threshold, distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drawdown_tracking() {
        let mut tracker = DrawdownTracker::new(dec!(5), dec!(10000));

        assert!(!tracker.update(dec!(10500)));
        assert_eq!(tracker.peak_equity(), dec!(10500));
        assert_eq!(tracker.current_drawdown_pct(), Decimal::ZERO);

        // (10500 - 10000) / 10500 ~ 4.76%
        assert!(!tracker.update(dec!(10000)));
        assert!(tracker.current_drawdown_pct() > dec!(4));
        assert!(tracker.current_drawdown_pct() < dec!(5));

        let (warning, _) = tracker.warning_check();
        assert!(warning);

        assert!(tracker.update(dec!(9900)));
        assert!(tracker.exceeds_limit());
    }

    #[test]
    fn test_recovery_keeps_session_mdd() {
        let mut tracker = DrawdownTracker::new(dec!(10), dec!(1000));
        tracker.update(dec!(950));
        tracker.update(dec!(1100));
        assert_eq!(tracker.current_drawdown_pct(), Decimal::ZERO);
        assert_eq!(tracker.session_mdd_pct(), dec!(5));
    }

    #[test]
    fn test_warning_only_near_limit() {
        let mut tracker = DrawdownTracker::new(dec!(10), dec!(1000));
        tracker.update(dec!(950));
        assert_eq!(tracker.warning_check(), (false, dec!(5)));

        tracker.update(dec!(910));
        let (warning, distance) = tracker.warning_check();
        assert!(warning);
        assert_eq!(distance, dec!(1));
    }
}
