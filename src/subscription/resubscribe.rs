//! Keeps a chain event subscription alive across transient disconnects

use super::{Subscription, TaskSubscription};
use crate::config::ResubscribeConfig;
use crate::error::{ChainError, ChainResult};
use crate::metrics;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

const DEFAULT_EVENT_BUFFER: usize = 16;

/// Resubscription policy
#[derive(Debug, Clone)]
pub struct ResubscribeOptions {
    /// Upper bound for the wait between two attempts
    pub backoff_max: Duration,
    /// Attempts closer together than this raise a threshold violation
    pub alert_threshold: Duration,
    /// Give up once retrying for this long without a successful subscribe; `None` retries forever
    pub max_elapsed: Option<Duration>,
    /// Pending callback events kept before new ones are dropped
    pub event_buffer: usize,
    span: Span,
}

impl ResubscribeOptions {
    pub fn new(backoff_max: Duration, alert_threshold: Duration) -> Self {
        Self {
            backoff_max,
            alert_threshold,
            max_elapsed: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            span: info_span!("resubscriber"),
        }
    }

    pub fn from_config(config: &ResubscribeConfig) -> Self {
        let mut options = Self::new(config.backoff_max(), config.alert_threshold())
            .with_event_buffer(config.event_buffer);
        options.max_elapsed = config.max_elapsed();
        options
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = Some(max_elapsed);
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    /// Span every log line of the supervising loop is recorded under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.backoff_max / 10,
            max_interval: self.backoff_max,
            multiplier: 2.0,
            max_elapsed_time: self.max_elapsed,
            ..ExponentialBackoff::default()
        };
        // Struct update keeps the default current interval
        backoff.reset();
        backoff
    }
}

/// Signals handed to the caller's callbacks off the supervising task
#[derive(Debug)]
enum ResubscribeEvent {
    ThresholdViolated(Duration),
    SubscribeFailed(ChainError),
}

/// Handle to a subscription kept alive by `with_resubscription`.
///
/// `err()` resolves with `ResubscriptionExhausted` when the backoff gives up, or
/// `None` after `unsubscribe()`.
#[derive(Debug)]
pub struct ResubscribedSubscription {
    inner: TaskSubscription,
}

#[async_trait]
impl Subscription for ResubscribedSubscription {
    async fn err(&mut self) -> Option<ChainError> {
        self.inner.err().await
    }

    fn unsubscribe(&mut self) {
        self.inner.unsubscribe();
    }
}

/// Wrap `subscribe_fn` so the subscription it establishes is re-established
/// whenever it ends or fails to be created.
///
/// `on_threshold_violation` receives the time since the previous attempt when
/// attempts come faster than `options.alert_threshold`; `on_failure` receives
/// every error `subscribe_fn` returns. Both run on a separate task and are
/// delivered at most once, best effort: if they fall behind by more than
/// `options.event_buffer` events, newer events are dropped.
pub fn with_resubscription<S, F, Fut, A, E>(
    options: ResubscribeOptions,
    subscribe_fn: F,
    on_threshold_violation: A,
    on_failure: E,
) -> ResubscribedSubscription
where
    S: Subscription,
    F: FnMut(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ChainResult<S>> + Send + 'static,
    A: Fn(Duration) + Send + 'static,
    E: Fn(ChainError) + Send + 'static,
{
    let span = options.span.clone();
    let (events_tx, mut events_rx) = mpsc::channel(options.event_buffer.max(1));

    tokio::spawn(
        async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ResubscribeEvent::ThresholdViolated(elapsed) => on_threshold_violation(elapsed),
                    ResubscribeEvent::SubscribeFailed(err) => on_failure(err),
                }
            }
        }
        .instrument(span.clone()),
    );

    let inner = TaskSubscription::spawn(move |cancel| {
        supervise(options, subscribe_fn, events_tx, cancel).instrument(span)
    });

    ResubscribedSubscription { inner }
}

async fn supervise<S, F, Fut>(
    options: ResubscribeOptions,
    mut subscribe_fn: F,
    events: mpsc::Sender<ResubscribeEvent>,
    cancel: CancellationToken,
) -> ChainResult<()>
where
    S: Subscription,
    F: FnMut(CancellationToken) -> Fut + Send,
    Fut: Future<Output = ChainResult<S>> + Send,
{
    let mut backoff = options.backoff();
    let mut last_attempt: Option<Instant> = None;

    loop {
        let now = Instant::now();
        if let Some(last) = last_attempt {
            let elapsed = now.duration_since(last);
            if elapsed < options.alert_threshold {
                warn!(
                    "Resubscribing {:?} after the previous attempt, below the {:?} threshold",
                    elapsed, options.alert_threshold
                );
                metrics::record_resubscription_alert();
                notify(&events, ResubscribeEvent::ThresholdViolated(elapsed));
            }
        }
        last_attempt = Some(now);

        let attempt = cancel.child_token();
        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = subscribe_fn(attempt) => result,
        };

        match result {
            Ok(mut sub) => {
                backoff.reset();
                debug!("Subscription established");

                tokio::select! {
                    _ = cancel.cancelled() => {
                        sub.unsubscribe();
                        let _ = sub.err().await;
                        info!("Unsubscribed");
                        return Ok(());
                    }
                    err = sub.err() => match err {
                        Some(e) => warn!("Subscription failed: {}", e),
                        None => info!("Subscription ended"),
                    }
                }
                sub.unsubscribe();
            }
            Err(e) => {
                warn!("Failed to subscribe: {}", e);
                metrics::record_subscribe_failure();
                notify(&events, ResubscribeEvent::SubscribeFailed(e));
            }
        }

        let Some(delay) = backoff.next_backoff() else {
            error!("Giving up on resubscription, backoff exhausted");
            return Err(ChainError::ResubscriptionExhausted);
        };
        metrics::record_resubscription();
        debug!("Resubscribing in {:?}", delay);

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn notify(events: &mpsc::Sender<ResubscribeEvent>, event: ResubscribeEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = events.try_send(event) {
        debug!("Dropping resubscription event {:?}, consumer is behind", event);
    }
}
