use tracing::{debug, warn};

use common::{
    CancellationToken, Error, FillPolicy, OrderRequest, OrderResult, Result, RetryPolicy,
    VenueSession, RETCODE_REJECT,
};

/// Send a market deal built by `build`, trying each fill policy in
/// `FillPolicy::PRIORITY` order until the venue accepts one.
///
/// Returns the last refusal as `Error::OrderRejected` if none is accepted.
/// Transport errors abort the sweep immediately.
pub async fn send_with_fill_fallback<F>(
    session: &mut dyn VenueSession,
    build: F,
) -> Result<OrderResult>
where
    F: Fn(FillPolicy) -> OrderRequest,
{
    let mut last = OrderResult {
        retcode: RETCODE_REJECT,
        ticket: 0,
        price: 0.0,
        comment: "no fill policy attempted".into(),
    };
    for filling in FillPolicy::PRIORITY {
        let request = build(filling);
        let result = session.order_send(&request).await?;
        if result.is_done() {
            debug!(symbol = %request.symbol(), %filling, ticket = result.ticket, "Deal accepted");
            return Ok(result);
        }
        debug!(
            symbol = %request.symbol(),
            %filling,
            retcode = result.retcode,
            comment = %result.comment,
            "Fill policy refused"
        );
        last = result;
    }
    last.into_result()
}

/// `send_with_fill_fallback` under a bounded retry policy.
pub async fn send_deal<F>(
    session: &mut dyn VenueSession,
    retry: &RetryPolicy,
    shutdown: &CancellationToken,
    label: &str,
    build: F,
) -> Result<OrderResult>
where
    F: Fn(FillPolicy) -> OrderRequest,
{
    let mut attempt = 1;
    loop {
        match send_with_fill_fallback(session, &build).await {
            Ok(done) => return Ok(done),
            Err(e) => {
                if let Err(e) = retry.next_attempt(shutdown, label, attempt, e).await {
                    if !matches!(e, Error::Cancelled) {
                        warn!(op = label, attempts = attempt, error = %e, "Deal abandoned");
                    }
                    return Err(e);
                }
            }
        }
        attempt += 1;
    }
}
