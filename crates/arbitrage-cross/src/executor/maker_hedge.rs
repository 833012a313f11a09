//! Maker-hedge execution: rest passively on one venue, hedge on the other.

use async_trait::async_trait;
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

use xarb_core::ExecutionMode;

use crate::detector::{ArbOpportunity, LegQuote};

use super::{
    ArbExecutor, AttemptState, ExecutionAttempt, ExecutionContext, FillProgress, LegRole,
    OrderRecord,
};

/// Rests a good-till-cancelled order at the passive top of book on the venue
/// with the better queue position, then hedges whatever fills with a
/// fill-and-kill order on the other venue.
#[derive(Debug)]
pub struct MakerHedgeExecutor {
    ctx: Arc<ExecutionContext>,
}

impl MakerHedgeExecutor {
    #[must_use]
    pub fn new(ctx: Arc<ExecutionContext>) -> Self {
        Self { ctx }
    }
}

/// The leg to rest passively: higher passive fill probability, then fewer
/// contracts queued ahead. Legs without a passive level are not eligible.
#[must_use]
pub fn choose_maker_leg(opportunity: &ArbOpportunity) -> Option<&LegQuote> {
    let buy = &opportunity.buy_leg;
    let sell = &opportunity.sell_leg;
    match (buy.passive_price.is_some(), sell.passive_price.is_some()) {
        (false, false) => None,
        (true, false) => Some(buy),
        (false, true) => Some(sell),
        (true, true) => {
            let by_probability = buy
                .passive_fill_probability
                .partial_cmp(&sell.passive_fill_probability)
                .unwrap_or(Ordering::Equal);
            let preferred = match by_probability {
                Ordering::Greater => buy,
                Ordering::Less => sell,
                Ordering::Equal if sell.passive_queue_ahead < buy.passive_queue_ahead => sell,
                Ordering::Equal => buy,
            };
            Some(preferred)
        }
    }
}

#[async_trait]
impl ArbExecutor for MakerHedgeExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::MakerHedge
    }

    async fn execute(&self, mut attempt: ExecutionAttempt) -> ExecutionAttempt {
        let ctx = &self.ctx;
        let attempt_id = attempt.attempt_id;
        let event_id = attempt.opportunity.event_id.clone();
        let size = attempt.size;

        let Some(maker_leg) = choose_maker_leg(&attempt.opportunity).cloned() else {
            warn!(%attempt_id, %event_id, "No passive level on either venue");
            return ctx.finalize(attempt);
        };
        let hedge_leg = attempt.opportunity.leg(maker_leg.venue.other()).clone();
        let Some(passive_price) = maker_leg.passive_price else {
            return ctx.finalize(attempt);
        };

        let mut maker = OrderRecord::passive(&maker_leg, passive_price, size);
        let mut hedge = OrderRecord::aggressive(&hedge_leg, LegRole::Hedge, size);

        info!(
            %attempt_id,
            %event_id,
            maker_venue = %maker.venue,
            maker_side = %maker.side,
            maker_price = %passive_price,
            queue_ahead = %maker_leg.passive_queue_ahead,
            hedge_venue = %hedge.venue,
            %size,
            "Resting maker leg"
        );

        let Some((maker_ref, mut maker_rx)) = ctx.submit(attempt_id, &event_id, &mut maker).await
        else {
            attempt.orders = vec![maker, hedge];
            return ctx.finalize(attempt);
        };
        ctx.advance(&mut attempt, AttemptState::Leg1Placed);

        let mut maker_progress = FillProgress::default();
        ctx.await_fills(&mut maker_rx, &mut maker_progress, size, ctx.config.maker_timeout)
            .await;

        if maker_progress.filled >= size {
            ctx.advance(&mut attempt, AttemptState::Leg1Filled);
        } else {
            ctx.advance(&mut attempt, AttemptState::Leg1Timeout);
            maker.cancel = Some(ctx.cancel(maker.venue, &maker_ref).await);
        }
        // A fill can race the cancel
        ctx.settle(
            attempt_id,
            &event_id,
            &maker,
            (maker_ref, maker_rx),
            &mut maker_progress,
        );
        ExecutionContext::apply_progress(&mut maker, &maker_progress);

        if !maker.is_filled() {
            info!(%attempt_id, %event_id, "Maker leg timed out unfilled");
            attempt.orders = vec![maker, hedge];
            return ctx.finalize(attempt);
        }

        // Hedge exactly what filled, re-scoring the race at the book's age now
        let elapsed_ms = (Utc::now() - attempt.opportunity.detected_at)
            .num_milliseconds()
            .max(0);
        hedge.requested_size = maker.filled_size;
        hedge.book_age_ms = hedge_leg.book_age_ms + elapsed_ms;
        hedge.predicted_fill_probability =
            ctx.race
                .fill_probability(hedge.venue, hedge.book_age_ms, hedge.queue_level_index);

        let Some((hedge_ref, mut hedge_rx)) = ctx.submit(attempt_id, &event_id, &mut hedge).await
        else {
            attempt.orders = vec![maker, hedge];
            return ctx.finalize(attempt);
        };
        ctx.advance(&mut attempt, AttemptState::Leg2Placed);

        let mut hedge_progress = FillProgress::default();
        ctx.await_fills(
            &mut hedge_rx,
            &mut hedge_progress,
            hedge.requested_size,
            ctx.config.taker_timeout,
        )
        .await;
        if hedge_progress.filled < hedge.requested_size {
            hedge.cancel = Some(ctx.cancel(hedge.venue, &hedge_ref).await);
        }
        ctx.settle(
            attempt_id,
            &event_id,
            &hedge,
            (hedge_ref, hedge_rx),
            &mut hedge_progress,
        );
        ExecutionContext::apply_progress(&mut hedge, &hedge_progress);

        attempt.orders = vec![maker, hedge];
        ctx.finalize(attempt)
    }
}
