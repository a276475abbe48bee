//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Relative difference of `a` over `b`, in percent. Signed.
pub fn pct_change(a: Decimal, b: Decimal) -> Decimal {
    if b == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (a - b) / b * dec!(100)
}

/// Convert a percentage (0.5 = 0.5%) into a fraction (0.005).
pub fn pct_to_fraction(pct: Decimal) -> Decimal {
    pct / dec!(100)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Quantity-weighted average of an existing holding and a new fill.
pub fn blend_price(
    old_price: Decimal,
    old_qty: Decimal,
    fill_price: Decimal,
    fill_qty: Decimal,
) -> Decimal {
    safe_div(old_price * old_qty + fill_price * fill_qty, old_qty + fill_qty)
}

/// Clamp a value into `[lo, hi]`.
pub fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    value.max(lo).min(hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_down_to_lot() {
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.001)), dec!(1.567));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(round_down_to_lot(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(round_down_to_lot(dec!(1.567), Decimal::ZERO), dec!(1.567));
    }

    #[test]
    fn test_pct_change() {
        assert_eq!(pct_change(dec!(100.60), dec!(100)), dec!(0.60));
        assert_eq!(pct_change(dec!(99), dec!(100)), dec!(-1));
        assert_eq!(pct_change(dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_blend_price() {
        // (100*2 + 130*1) / 3 = 110
        assert_eq!(blend_price(dec!(100), dec!(2), dec!(130), dec!(1)), dec!(110));
        assert_eq!(blend_price(Decimal::ZERO, Decimal::ZERO, dec!(50), dec!(1)), dec!(50));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp(dec!(1.5), Decimal::ZERO, Decimal::ONE), Decimal::ONE);
        assert_eq!(clamp(dec!(-0.2), Decimal::ZERO, Decimal::ONE), Decimal::ZERO);
    }
}
