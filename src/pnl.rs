//! Position update arithmetic for broker fills.
//!
//! Pure functions over [`Position`], exercised by the webhook ingestor inside
//! the ledger transaction. Longs are positive qty, shorts negative; realized
//! P&L accrues only when a fill reduces or flips the existing side.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;

use crate::models::{Position, Side};

/// Apply a fill of `qty` shares at `price` to `position`.
///
/// Same-side adds recompute the weighted average entry. Reducing fills keep
/// the average and realize `(price - avg) * qty` (sign-flipped for short
/// covers). A fill crossing zero realizes the full prior side first, then
/// opens the remainder on the opposite side at the fill price.
pub fn apply_fill(
    position: &mut Position,
    side: Side,
    qty: Decimal,
    price: Decimal,
    filled_at: DateTime<Utc>,
) {
    debug_assert!(qty > Decimal::ZERO);

    let old_qty = position.qty;
    let delta = side.signed(qty);

    if old_qty.is_zero() {
        // Opening from flat.
        position.qty = delta;
        position.avg_entry_price = price;
    } else if old_qty.signum() == delta.signum() {
        // Adding to the current side: weighted average entry.
        let old_abs = old_qty.abs();
        let new_abs = old_abs + qty;
        position.avg_entry_price =
            (old_abs * position.avg_entry_price + qty * price) / new_abs;
        position.qty = old_qty + delta;
    } else if qty <= old_qty.abs() {
        // Reducing within the current side: average unchanged.
        position.realized_pl += realized_on_close(old_qty, position.avg_entry_price, price, qty);
        position.qty = old_qty + delta;
        if position.qty.is_zero() {
            position.avg_entry_price = Decimal::ZERO;
        }
    } else {
        // Crossing zero: close the whole prior side, open the rest opposite.
        let closed = old_qty.abs();
        position.realized_pl +=
            realized_on_close(old_qty, position.avg_entry_price, price, closed);
        let remainder = qty - closed;
        position.qty = side.signed(remainder);
        position.avg_entry_price = price;
    }

    position.updated_at = filled_at;
    position.last_trade_at = Some(filled_at);
}

/// P&L realized by closing `qty` of a position entered at `avg`:
/// `(price - avg) * qty` for longs, `(avg - price) * qty` for shorts.
fn realized_on_close(old_qty: Decimal, avg: Decimal, price: Decimal, qty: Decimal) -> Decimal {
    if old_qty > Decimal::ZERO {
        (price - avg) * qty
    } else {
        (avg - price) * qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pos() -> Position {
        Position::flat("AAPL", Utc::now())
    }

    #[test]
    fn open_from_flat() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(150.00), Utc::now());
        assert_eq!(p.qty, dec!(100));
        assert_eq!(p.avg_entry_price, dec!(150.00));
        assert_eq!(p.realized_pl, dec!(0));
    }

    #[test]
    fn same_side_add_recomputes_weighted_average() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(150.00), Utc::now());
        apply_fill(&mut p, Side::Buy, dec!(50), dec!(156.00), Utc::now());
        assert_eq!(p.qty, dec!(150));
        assert_eq!(p.avg_entry_price, dec!(152.00));
        assert_eq!(p.realized_pl, dec!(0));
    }

    #[test]
    fn reducing_realizes_against_average() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(150.00), Utc::now());
        apply_fill(&mut p, Side::Sell, dec!(40), dec!(155.00), Utc::now());
        assert_eq!(p.qty, dec!(60));
        assert_eq!(p.avg_entry_price, dec!(150.00));
        assert_eq!(p.realized_pl, dec!(200.00));
    }

    #[test]
    fn full_close_resets_average() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(150.00), Utc::now());
        apply_fill(&mut p, Side::Sell, dec!(100), dec!(149.00), Utc::now());
        assert_eq!(p.qty, dec!(0));
        assert_eq!(p.avg_entry_price, dec!(0));
        assert_eq!(p.realized_pl, dec!(-100.00));
    }

    #[test]
    fn short_cover_realizes_inverse() {
        let mut p = pos();
        apply_fill(&mut p, Side::Sell, dec!(100), dec!(150.00), Utc::now());
        assert_eq!(p.qty, dec!(-100));
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(145.00), Utc::now());
        assert_eq!(p.qty, dec!(0));
        assert_eq!(p.realized_pl, dec!(500.00));
    }

    #[test]
    fn cross_zero_closes_then_opens_at_fill_price() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(100), dec!(150.00), Utc::now());
        apply_fill(&mut p, Side::Sell, dec!(160), dec!(155.00), Utc::now());
        // 100 closed at +5 each, 60 opened short at 155.
        assert_eq!(p.qty, dec!(-60));
        assert_eq!(p.avg_entry_price, dec!(155.00));
        assert_eq!(p.realized_pl, dec!(500.00));
    }

    #[test]
    fn qty_is_signed_sum_of_fills_regardless_of_order() {
        let fills = [
            (Side::Buy, dec!(30), dec!(10.00)),
            (Side::Buy, dec!(70), dec!(12.00)),
            (Side::Sell, dec!(50), dec!(11.00)),
            (Side::Sell, dec!(80), dec!(13.00)),
        ];
        let mut p = pos();
        for (side, qty, price) in fills {
            apply_fill(&mut p, side, qty, price, Utc::now());
        }
        let expected: Decimal = fills.iter().map(|(s, q, _)| s.signed(*q)).sum();
        assert_eq!(p.qty, expected);
    }

    #[test]
    fn fractional_fills_supported() {
        let mut p = pos();
        apply_fill(&mut p, Side::Buy, dec!(0.5), dec!(100.00), Utc::now());
        apply_fill(&mut p, Side::Buy, dec!(0.25), dec!(104.00), Utc::now());
        assert_eq!(p.qty, dec!(0.75));
        assert_eq!(p.avg_entry_price.round_dp(6), dec!(101.333333));
    }
}
