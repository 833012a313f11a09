//! Walk-the-book pricing.
//!
//! Provides [`walk_book`] to price an aggressive order of a given size against
//! consecutive levels, stopping at the slippage bound. One contract pays $1,
//! so a size in contracts is also its face-value notional.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use xarb_core::{OrderLevel, Side};

/// Basis points per unit.
pub const BPS: Decimal = dec!(10000);

/// Executable price and size for one leg, produced fresh on each evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableQuote {
    /// Direction of the aggressive order.
    pub side: Side,
    /// Size asked for.
    pub requested_size: Decimal,
    /// Size fillable inside the slippage bound; never above `requested_size`.
    pub max_size: Decimal,
    /// Size-weighted average price over the consumed levels.
    pub vwap_price: Decimal,
    /// Top-of-book price.
    pub best_price: Decimal,
    /// Least favorable price consumed; a marketable limit at this price fills `max_size`.
    pub worst_price: Decimal,
    /// Sum of `price * size` over consumed levels.
    pub notional: Decimal,
    /// Distance of the VWAP from the top of book, in bps of the top price.
    pub slippage_bps: Decimal,
    /// Index of the deepest level touched (0 = top).
    pub levels_consumed: usize,
    /// Probability the leg fills before the book moves. 1.0 until a race model is applied.
    pub fill_probability: f64,
    /// True when the full requested size was available inside the bound.
    pub sufficient_depth: bool,
}

impl ExecutableQuote {
    /// Quote for a book with nothing to take.
    #[must_use]
    pub fn empty(side: Side, requested_size: Decimal) -> Self {
        Self {
            side,
            requested_size,
            max_size: Decimal::ZERO,
            vwap_price: Decimal::ZERO,
            best_price: Decimal::ZERO,
            worst_price: Decimal::ZERO,
            notional: Decimal::ZERO,
            slippage_bps: Decimal::ZERO,
            levels_consumed: 0,
            fill_probability: 1.0,
            sufficient_depth: false,
        }
    }

    /// True when nothing can be filled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_size.is_zero()
    }

    /// Index of the deepest queue level this order would reach.
    #[must_use]
    pub fn queue_level_index(&self) -> usize {
        self.levels_consumed.saturating_sub(1)
    }

    /// Sets the fill probability.
    #[must_use]
    pub fn with_fill_probability(mut self, probability: f64) -> Self {
        self.fill_probability = probability;
        self
    }
}

/// Worst price an aggressive order on `side` may reach from `best`.
///
/// Buys may pay up to `best * (1 + bps/10000)`, sells may receive down to
/// `best * (1 - bps/10000)`.
#[must_use]
pub fn price_limit(best: Decimal, side: Side, max_slippage_bps: Decimal) -> Decimal {
    let move_frac = max_slippage_bps / BPS;
    match side {
        Side::Buy => best * (Decimal::ONE + move_frac),
        Side::Sell => best * (Decimal::ONE - move_frac),
    }
}

fn within_limit(price: Decimal, limit: Decimal, side: Side) -> bool {
    match side {
        Side::Buy => price <= limit,
        Side::Sell => price >= limit,
    }
}

/// Walks `levels` in order until `target_size` is filled or the next level
/// lies beyond `max_slippage_bps` from the top.
///
/// `levels` must be ordered best-first: ascending asks for a buy, descending
/// bids for a sell (as stored in an `OrderbookSnapshot`). An empty book or a
/// non-positive target yields an empty quote rather than an error.
#[must_use]
pub fn walk_book(
    levels: &[OrderLevel],
    side: Side,
    target_size: Decimal,
    max_slippage_bps: Decimal,
) -> ExecutableQuote {
    let Some(top) = levels.first() else {
        return ExecutableQuote::empty(side, target_size);
    };
    if target_size <= Decimal::ZERO {
        return ExecutableQuote::empty(side, target_size);
    }

    let best_price = top.price;
    let limit = price_limit(best_price, side, max_slippage_bps);

    let mut filled = Decimal::ZERO;
    let mut notional = Decimal::ZERO;
    let mut worst_price = best_price;
    let mut levels_consumed = 0;

    for level in levels {
        if filled >= target_size || !within_limit(level.price, limit, side) {
            break;
        }
        let take = level.size.min(target_size - filled);
        if take <= Decimal::ZERO {
            continue;
        }
        notional += take * level.price;
        filled += take;
        worst_price = level.price;
        levels_consumed += 1;
    }

    if filled.is_zero() {
        return ExecutableQuote::empty(side, target_size);
    }

    let vwap_price = notional / filled;
    let slippage_bps = ((vwap_price - best_price).abs() / best_price) * BPS;

    ExecutableQuote {
        side,
        requested_size: target_size,
        max_size: filled,
        vwap_price,
        best_price,
        worst_price,
        notional,
        slippage_bps,
        levels_consumed,
        fill_probability: 1.0,
        sufficient_depth: filled >= target_size,
    }
}

/// Total size available inside the slippage bound.
#[must_use]
pub fn depth_within(levels: &[OrderLevel], side: Side, max_slippage_bps: Decimal) -> Decimal {
    let Some(top) = levels.first() else {
        return Decimal::ZERO;
    };
    let limit = price_limit(top.price, side, max_slippage_bps);
    levels
        .iter()
        .take_while(|l| within_limit(l.price, limit, side))
        .map(|l| l.size)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(levels: &[(Decimal, Decimal)]) -> Vec<OrderLevel> {
        levels
            .iter()
            .map(|(p, s)| OrderLevel::new(*p, *s))
            .collect()
    }

    // ==================== Scenario Tests ====================

    #[test]
    fn test_single_bid_level_partial_take() {
        let bids = book(&[(dec!(0.52), dec!(100))]);
        let quote = walk_book(&bids, Side::Sell, dec!(60), dec!(100));

        assert_eq!(quote.max_size, dec!(60));
        assert_eq!(quote.vwap_price, dec!(0.52));
        assert_eq!(quote.slippage_bps, Decimal::ZERO);
        assert!(quote.sufficient_depth);
        assert_eq!(quote.queue_level_index(), 0);
    }

    #[test]
    fn test_first_ask_level_sufficient() {
        let asks = book(&[(dec!(0.30), dec!(50)), (dec!(0.32), dec!(80))]);
        let quote = walk_book(&asks, Side::Buy, dec!(40), dec!(1000));

        assert_eq!(quote.max_size, dec!(40));
        assert_eq!(quote.vwap_price, dec!(0.30));
        assert_eq!(quote.levels_consumed, 1);
        assert_eq!(quote.worst_price, dec!(0.30));
    }

    #[test]
    fn test_walks_multiple_levels() {
        let asks = book(&[(dec!(0.30), dec!(50)), (dec!(0.32), dec!(50))]);
        let quote = walk_book(&asks, Side::Buy, dec!(100), dec!(1000));

        assert_eq!(quote.max_size, dec!(100));
        assert_eq!(quote.vwap_price, dec!(0.31));
        assert_eq!(quote.worst_price, dec!(0.32));
        assert_eq!(quote.notional, dec!(31));
        assert_eq!(quote.queue_level_index(), 1);
    }

    // ==================== Slippage Bound Tests ====================

    #[test]
    fn test_stops_at_slippage_bound_for_buys() {
        // 0.30 * 1.05 = 0.315, so the 0.32 level is out of bounds
        let asks = book(&[(dec!(0.30), dec!(50)), (dec!(0.32), dec!(80))]);
        let quote = walk_book(&asks, Side::Buy, dec!(100), dec!(500));

        assert_eq!(quote.max_size, dec!(50));
        assert!(!quote.sufficient_depth);
        assert_eq!(quote.vwap_price, dec!(0.30));
    }

    #[test]
    fn test_stops_at_slippage_bound_for_sells() {
        // 0.50 * 0.98 = 0.49: 0.49 is inside, 0.48 is not
        let bids = book(&[
            (dec!(0.50), dec!(10)),
            (dec!(0.49), dec!(10)),
            (dec!(0.48), dec!(10)),
        ]);
        let quote = walk_book(&bids, Side::Sell, dec!(30), dec!(200));

        assert_eq!(quote.max_size, dec!(20));
        assert_eq!(quote.vwap_price, dec!(0.495));
        assert_eq!(quote.worst_price, dec!(0.49));
        assert_eq!(quote.slippage_bps, dec!(100));
    }

    #[test]
    fn test_vwap_and_size_stay_in_bounds() {
        let asks = book(&[
            (dec!(0.41), dec!(7)),
            (dec!(0.42), dec!(3)),
            (dec!(0.43), dec!(11)),
            (dec!(0.47), dec!(40)),
            (dec!(0.60), dec!(100)),
        ]);
        let bids = book(&[
            (dec!(0.39), dec!(5)),
            (dec!(0.37), dec!(9)),
            (dec!(0.33), dec!(20)),
            (dec!(0.20), dec!(100)),
        ]);

        for bps in [dec!(0), dec!(50), dec!(250), dec!(1000), dec!(5000)] {
            for target in [dec!(1), dec!(8), dec!(21), dec!(60), dec!(500)] {
                let buy = walk_book(&asks, Side::Buy, target, bps);
                assert!(buy.max_size <= target);
                assert!(buy.max_size <= depth_within(&asks, Side::Buy, bps));
                assert!(buy.vwap_price >= dec!(0.41));
                assert!(buy.vwap_price <= price_limit(dec!(0.41), Side::Buy, bps));

                let sell = walk_book(&bids, Side::Sell, target, bps);
                assert!(sell.max_size <= target);
                assert!(sell.max_size <= depth_within(&bids, Side::Sell, bps));
                assert!(sell.vwap_price <= dec!(0.39));
                assert!(sell.vwap_price >= price_limit(dec!(0.39), Side::Sell, bps));
            }
        }
    }

    // ==================== Edge Case Tests ====================

    #[test]
    fn test_empty_book_returns_zero_quote() {
        let quote = walk_book(&[], Side::Buy, dec!(100), dec!(100));
        assert!(quote.is_empty());
        assert_eq!(quote.vwap_price, Decimal::ZERO);
        assert!(!quote.sufficient_depth);
    }

    #[test]
    fn test_non_positive_target_returns_zero_quote() {
        let asks = book(&[(dec!(0.30), dec!(50))]);
        assert!(walk_book(&asks, Side::Buy, Decimal::ZERO, dec!(100)).is_empty());
        assert!(walk_book(&asks, Side::Buy, dec!(-5), dec!(100)).is_empty());
    }

    #[test]
    fn test_depth_within() {
        let asks = book(&[(dec!(0.30), dec!(50)), (dec!(0.32), dec!(80))]);
        assert_eq!(depth_within(&asks, Side::Buy, dec!(500)), dec!(50));
        assert_eq!(depth_within(&asks, Side::Buy, dec!(1000)), dec!(130));
        assert_eq!(depth_within(&[], Side::Buy, dec!(1000)), Decimal::ZERO);
    }
}
