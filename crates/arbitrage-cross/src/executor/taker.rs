//! Taker-taker execution: both legs cross the spread concurrently.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use xarb_core::ExecutionMode;

use super::{
    ArbExecutor, AttemptState, ExecutionAttempt, ExecutionContext, FillProgress, LegRole,
    OrderRecord,
};

/// Sends fill-and-kill orders on both venues at once.
///
/// If only one leg fills, the other is cancelled and the directional
/// position is left to the inventory tracker with a critical alert.
#[derive(Debug)]
pub struct TakerExecutor {
    ctx: Arc<ExecutionContext>,
}

impl TakerExecutor {
    #[must_use]
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ArbExecutor for TakerExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Taker
    }

    async fn execute(&self, mut attempt: ExecutionAttempt) -> ExecutionAttempt {
        let ctx = &self.ctx;
        let attempt_id = attempt.attempt_id;
        let event_id = attempt.opportunity.event_id.clone();
        let size = attempt.size;

        let mut buy = OrderRecord::aggressive(&attempt.opportunity.buy_leg, LegRole::Taker, size);
        let mut sell = OrderRecord::aggressive(&attempt.opportunity.sell_leg, LegRole::Taker, size);

        info!(
            %attempt_id,
            %event_id,
            buy_venue = %buy.venue,
            buy_limit = %buy.limit_price,
            sell_venue = %sell.venue,
            sell_limit = %sell.limit_price,
            %size,
            "Placing taker legs"
        );

        let (buy_placed, sell_placed) = tokio::join!(
            ctx.submit(attempt_id, &event_id, &mut buy),
            ctx.submit(attempt_id, &event_id, &mut sell),
        );

        match (&buy_placed, &sell_placed) {
            (None, None) => {
                attempt.orders = vec![buy, sell];
                return ctx.finalize(attempt);
            }
            (Some(_), Some(_)) => {
                ctx.advance(&mut attempt, AttemptState::Leg1Placed);
                ctx.advance(&mut attempt, AttemptState::Leg2Placed);
            }
            _ => ctx.advance(&mut attempt, AttemptState::Leg1Placed),
        }

        let wait = ctx.config.taker_timeout;
        let mut buy_progress = FillProgress::default();
        let mut sell_progress = FillProgress::default();

        let (buy_placed, sell_placed) = tokio::join!(
            ctx.await_placed(buy_placed, &mut buy_progress, size, wait),
            ctx.await_placed(sell_placed, &mut sell_progress, size, wait),
        );

        // Cancel whatever was not taken. A fill-and-kill order is normally
        // gone already, which the venue reports as nothing to cancel.
        for (placed, record, progress) in [
            (buy_placed, &mut buy, &mut buy_progress),
            (sell_placed, &mut sell, &mut sell_progress),
        ] {
            if let Some(placed) = placed {
                if progress.filled < size {
                    record.cancel = Some(ctx.cancel(record.venue, &placed.0).await);
                }
                ctx.settle(attempt_id, &event_id, record, placed, progress);
            }
            ExecutionContext::apply_progress(record, progress);
        }

        if buy.is_filled() != sell.is_filled() {
            warn!(
                %attempt_id,
                %event_id,
                buy_filled = %buy.filled_size,
                sell_filled = %sell.filled_size,
                "Only one taker leg filled"
            );
        }

        attempt.orders = vec![buy, sell];
        ctx.finalize(attempt)
    }
}
