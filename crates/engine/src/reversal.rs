use tracing::{error, info};

use common::{
    order_tag, CancellationToken, EnrichedSignal, Error, OrderRequest, OrderResult, Position,
    PositionFilter, Result, RetryPolicy, Tick, VenueSession, DEFAULT_DEVIATION,
};
use policy::{ReversalMode, StrategyPolicy};

use crate::order::send_deal;

/// What closing the opposite exposure achieved.
#[derive(Debug, Clone, PartialEq)]
pub enum Reversal {
    /// Reversal handling is off, or nothing opposite was open.
    NothingToClose,
    /// Every opposite position was closed. Holds the last closing deal.
    Closed { count: usize, last: OrderResult },
}

/// Close every open position on the opposite side of `signal`'s symbol.
///
/// With `magic_restriction` only positions carrying the strategy's magic
/// number are considered. If any close fails the remaining exposure is
/// reported as `Error::PartialReversal` and the caller must not open the
/// new leg.
pub async fn close_opposites(
    session: &mut dyn VenueSession,
    signal: &EnrichedSignal,
    policy: &StrategyPolicy,
    tick: &Tick,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
) -> Result<Reversal> {
    if policy.reversal.mode == ReversalMode::Off {
        return Ok(Reversal::NothingToClose);
    }
    let filter = PositionFilter {
        symbol: Some(signal.symbol.clone()),
        magic: policy.reversal.magic_restriction.then_some(policy.magic),
    };
    let opposite = signal.side.opposite();
    let targets: Vec<Position> = session
        .positions_get(&filter)
        .await?
        .into_iter()
        .filter(|p| p.side == opposite)
        .collect();
    if targets.is_empty() {
        return Ok(Reversal::NothingToClose);
    }

    let total = targets.len();
    let mut last = None;
    let mut closed = 0;
    for position in &targets {
        let close = |filling| OrderRequest::Deal {
            symbol: position.symbol.clone(),
            side: signal.side,
            volume: position.volume,
            price: tick.exit_price(position.side),
            deviation: DEFAULT_DEVIATION,
            magic: policy.magic,
            comment: order_tag(&signal.strategy_id),
            filling,
            position: Some(position.ticket),
        };
        match send_deal(session, retry, shutdown, "reversal_close", close).await {
            Ok(result) => {
                info!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    ticket = position.ticket,
                    price = result.price,
                    "Opposite position closed"
                );
                closed += 1;
                last = Some(result);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                error!(
                    strategy = %signal.strategy_id,
                    symbol = %signal.symbol,
                    ticket = position.ticket,
                    error = %e,
                    "Failed to close opposite position"
                );
            }
        }
    }

    match last {
        Some(last) if closed == total => Ok(Reversal::Closed {
            count: closed,
            last,
        }),
        _ => Err(Error::PartialReversal {
            symbol: signal.symbol.clone(),
            closed,
            total,
        }),
    }
}
