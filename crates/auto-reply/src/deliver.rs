//! Deliver stage: send segments through a transport with bounded retries.

use std::panic::AssertUnwindSafe;

use {
    courier_channels::ChannelOutbound,
    courier_common::{
        Envelope, Reply,
        hooks::{HookContext, HookFlow, HookPoint, HookRegistry},
        panic_message,
    },
    courier_config::DeliveryConfig,
    futures::FutureExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, warn},
};

#[cfg(feature = "metrics")]
use courier_metrics::{channels as ch_metrics, counter, labels};

/// What happened to the segments of one reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    /// Segments an on_deliver hook suppressed.
    pub skipped: usize,
    /// Segments dropped after exhausting retries.
    pub failed: usize,
    /// Delivery stopped early because the session was cancelled.
    pub cancelled: bool,
}

enum SendOutcome {
    Sent,
    Failed,
    Cancelled,
}

pub struct Deliverer {
    config: DeliveryConfig,
}

impl Deliverer {
    pub fn new(config: DeliveryConfig) -> Self {
        Self { config }
    }

    /// Send `segments` in order to `to`.
    ///
    /// The cancellation token is checked before every segment, so a session
    /// reset stops stale replies from going out.
    pub async fn deliver(
        &self,
        outbound: &dyn ChannelOutbound,
        to: &str,
        envelope: &Envelope,
        segments: Vec<Reply>,
        hooks: &HookRegistry,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for segment in segments {
            if cancel.is_cancelled() {
                debug!(envelope_id = %envelope.id(), "delivery cancelled");
                report.cancelled = true;
                break;
            }

            let segment = if hooks.has_handlers(HookPoint::OnDeliver) {
                let mut ctx = HookContext::new(HookPoint::OnDeliver, envelope.clone(), Some(segment));
                match (hooks.dispatch(&mut ctx).await, ctx.reply) {
                    (HookFlow::Continue, Some(reply)) => reply,
                    _ => {
                        debug!(envelope_id = %envelope.id(), "segment suppressed by hook");
                        report.skipped += 1;
                        continue;
                    },
                }
            } else {
                segment
            };

            match self.send_with_retry(outbound, to, envelope, &segment, cancel).await {
                SendOutcome::Sent => report.sent += 1,
                SendOutcome::Failed => report.failed += 1,
                SendOutcome::Cancelled => {
                    report.cancelled = true;
                    break;
                },
            }
        }

        report
    }

    async fn send_with_retry(
        &self,
        outbound: &dyn ChannelOutbound,
        to: &str,
        envelope: &Envelope,
        reply: &Reply,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            // A panicking transport counts as a failed attempt.
            let result = AssertUnwindSafe(outbound.send(to, reply, envelope))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(anyhow::anyhow!(
                        "transport panicked: {}",
                        panic_message(panic.as_ref())
                    ))
                });
            match result {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    counter!(ch_metrics::SEGMENTS_SENT_TOTAL, labels::CHANNEL => outbound.id().to_string())
                        .increment(1);
                    return SendOutcome::Sent;
                },
                Err(e) if attempt >= max_attempts => {
                    error!(
                        channel = outbound.id(),
                        envelope_id = %envelope.id(),
                        attempt,
                        error = %e,
                        "send failed, giving up"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(ch_metrics::SEND_FAILURES_TOTAL, labels::CHANNEL => outbound.id().to_string())
                        .increment(1);
                    return SendOutcome::Failed;
                },
                Err(e) => {
                    let delay = self.config.backoff_for(attempt);
                    warn!(
                        channel = outbound.id(),
                        envelope_id = %envelope.id(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "send failed, retrying"
                    );
                    #[cfg(feature = "metrics")]
                    counter!(ch_metrics::SEND_RETRIES_TOTAL, labels::CHANNEL => outbound.id().to_string())
                        .increment(1);
                    tokio::select! {
                        () = cancel.cancelled() => return SendOutcome::Cancelled,
                        () = tokio::time::sleep(delay) => {},
                    }
                    attempt += 1;
                },
            }
        }
    }
}
