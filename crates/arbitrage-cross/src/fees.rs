//! Venue fee rules.
//!
//! Each venue's fee is a pure function `(price, contracts) -> dollars`,
//! looked up in a venue-keyed [`FeeSchedule`].

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::Arc;

use xarb_core::{FeeModel, Venue, VenuePair};

/// Fee in dollars for filling `contracts` at `price`.
pub type FeeFn = Arc<dyn Fn(Decimal, Decimal) -> Decimal + Send + Sync>;

/// Kalshi trading fee: `ceil_to_cent(rate * C * P * (1 - P))`.
#[must_use]
pub fn kalshi_fee(rate: Decimal, price: Decimal, contracts: Decimal) -> Decimal {
    if contracts <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let raw = rate * contracts * price * (Decimal::ONE - price);
    raw.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero)
}

/// Flat percentage of traded value.
#[must_use]
pub fn proportional_fee(rate: Decimal, price: Decimal, contracts: Decimal) -> Decimal {
    if contracts <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    rate * price * contracts
}

/// Builds the fee function for a configured model.
#[must_use]
pub fn fee_fn(model: FeeModel) -> FeeFn {
    match model {
        FeeModel::Kalshi { rate } => {
            Arc::new(move |price: Decimal, contracts: Decimal| kalshi_fee(rate, price, contracts))
        }
        FeeModel::Proportional { rate } => Arc::new(move |price: Decimal, contracts: Decimal| {
            proportional_fee(rate, price, contracts)
        }),
        FeeModel::Zero => Arc::new(|_: Decimal, _: Decimal| Decimal::ZERO),
    }
}

/// Venue-keyed fee table.
#[derive(Clone)]
pub struct FeeSchedule {
    fees: HashMap<Venue, FeeFn>,
}

impl std::fmt::Debug for FeeSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut venues: Vec<_> = self.fees.keys().collect();
        venues.sort();
        f.debug_struct("FeeSchedule")
            .field("venues", &venues)
            .finish()
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::from_models(&VenuePair::new(
            FeeModel::kalshi_default(),
            FeeModel::polymarket_default(),
        ))
    }
}

impl FeeSchedule {
    /// Builds the table from per-venue config.
    #[must_use]
    pub fn from_models(models: &VenuePair<FeeModel>) -> Self {
        let fees = Venue::ALL
            .into_iter()
            .map(|venue| (venue, fee_fn(*models.get(venue))))
            .collect();
        Self { fees }
    }

    /// A schedule with no fees on either venue.
    #[must_use]
    pub fn zero() -> Self {
        Self::from_models(&VenuePair::splat(FeeModel::Zero))
    }

    /// Overrides one venue's rule.
    #[must_use]
    pub fn with_fee(mut self, venue: Venue, fee: FeeFn) -> Self {
        self.fees.insert(venue, fee);
        self
    }

    /// Fee in dollars for a fill on `venue`. Unknown venues pay nothing.
    #[must_use]
    pub fn fee(&self, venue: Venue, price: Decimal, contracts: Decimal) -> Decimal {
        self.fees
            .get(&venue)
            .map_or(Decimal::ZERO, |f| f(price, contracts))
    }

    /// Combined per-contract fee for a buy on one venue and a sell on the other.
    #[must_use]
    pub fn per_contract(
        &self,
        buy_venue: Venue,
        buy_price: Decimal,
        sell_venue: Venue,
        sell_price: Decimal,
        contracts: Decimal,
    ) -> Decimal {
        if contracts <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let total = self.fee(buy_venue, buy_price, contracts)
            + self.fee(sell_venue, sell_price, contracts);
        total / contracts
    }
}
