//! Alert dispatcher - delivers geofence events off the detection path
//!
//! The scheduler enqueues event ids through a bounded mpsc channel. Each event
//! is delivered in its own task (bounded by a semaphore), retried with
//! exponential backoff while it stays pending, and settled exactly once from
//! the channel's actual outcome. A periodic scan re-enqueues pending events
//! that fell out of the queue (drops, restarts).

use crate::domain::event::{DeliveryError, GeofenceEvent};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_log::EventLog;
use crate::io::notifier::{ChannelOutcome, Notification, NotificationChannel};
use crate::services::directory::RecipientDirectory;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events delivered concurrently
const MAX_CONCURRENT_DELIVERIES: usize = 16;

/// Retry and timeout settings
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub recovery_interval: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_millis(config.dispatch_timeout_ms()),
            max_attempts: config.dispatch_max_attempts().max(1),
            backoff_initial: Duration::from_millis(config.backoff_initial_ms()),
            backoff_max: Duration::from_millis(config.backoff_max_ms()),
            recovery_interval: Duration::from_millis(config.backoff_max_ms().max(1000)),
        }
    }
}

/// Exponential backoff before retry number `attempt` (1-based), capped
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let base = initial.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(max.as_secs_f64());

    // Deterministic spread seeded from the attempt number, never above the cap
    let jitter_factor = 1.0 - 0.2 * (attempt as f64 * 7.3).sin().abs();
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

/// Enqueue side of the dispatcher
#[derive(Clone)]
pub struct DispatchSender {
    tx: mpsc::Sender<Uuid>,
    metrics: Arc<Metrics>,
}

impl DispatchSender {
    /// Non-blocking enqueue. A full queue leaves the event pending for the
    /// recovery scan.
    pub fn enqueue(&self, event_id: Uuid) {
        match self.tx.try_send(event_id) {
            Ok(()) => {
                let depth = self.tx.max_capacity() - self.tx.capacity();
                self.metrics.set_dispatch_queue_depth(depth as u64);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_dispatch_dropped();
                warn!(event_id = %event_id, "dispatch_queue_full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(event_id = %event_id, "dispatch_queue_closed");
            }
        }
    }
}

/// Create a dispatcher and its enqueue handle
pub fn create_dispatcher(
    queue_size: usize,
    events: Arc<EventLog>,
    channel: Arc<dyn NotificationChannel>,
    recipients: Arc<dyn RecipientDirectory>,
    settings: DispatchSettings,
    metrics: Arc<Metrics>,
) -> (DispatchSender, Dispatcher) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    let sender = DispatchSender { tx, metrics: metrics.clone() };
    let dispatcher = Dispatcher {
        inner: Arc::new(DeliveryContext {
            events,
            channel,
            recipients,
            settings,
            metrics,
            in_flight: Mutex::new(FxHashSet::default()),
        }),
        rx,
    };
    (sender, dispatcher)
}

struct DeliveryContext {
    events: Arc<EventLog>,
    channel: Arc<dyn NotificationChannel>,
    recipients: Arc<dyn RecipientDirectory>,
    settings: DispatchSettings,
    metrics: Arc<Metrics>,
    in_flight: Mutex<FxHashSet<Uuid>>,
}

pub struct Dispatcher {
    inner: Arc<DeliveryContext>,
    rx: mpsc::Receiver<Uuid>,
}

impl Dispatcher {
    /// Run until shutdown. Deliveries cut short by shutdown stay pending.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            channel = %self.inner.channel.name(),
            pending = %self.inner.events.pending_count(),
            "dispatcher_started"
        );

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));
        let mut tasks = JoinSet::new();
        let mut recovery = tokio::time::interval(self.inner.settings.recovery_interval);

        loop {
            tokio::select! {
                maybe_id = self.rx.recv() => {
                    let Some(id) = maybe_id else { break };
                    self.spawn_delivery(&mut tasks, &semaphore, id);
                }
                // First tick fires immediately: re-enqueues events left pending at startup
                _ = recovery.tick() => {
                    for event in self.inner.events.pending() {
                        self.spawn_delivery(&mut tasks, &semaphore, event.id);
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!(error = %e, "delivery_task_panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tasks.shutdown().await;
        info!(pending = %self.inner.events.pending_count(), "dispatcher_stopped");
    }

    fn spawn_delivery(&self, tasks: &mut JoinSet<()>, semaphore: &Arc<Semaphore>, id: Uuid) {
        if !self.inner.in_flight.lock().insert(id) {
            return;
        }
        let ctx = self.inner.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            if let Ok(_permit) = semaphore.acquire_owned().await {
                ctx.deliver(id).await;
            }
            ctx.in_flight.lock().remove(&id);
        });
    }

    /// Deliver one event to completion (used directly by tests)
    pub async fn deliver(&self, id: Uuid) -> Option<GeofenceEvent> {
        self.inner.deliver(id).await
    }
}

impl DeliveryContext {
    async fn deliver(&self, id: Uuid) -> Option<GeofenceEvent> {
        let event = self.events.get(id).filter(GeofenceEvent::is_pending)?;

        let recipients = self.recipients.recipients_for_group(&event.site_group);
        if recipients.is_empty() {
            let error = DeliveryError::NoRecipients { group: event.site_group.clone() };
            return self.settle_failed(&event, error, 0).await;
        }

        let notification = Notification::compose(&event);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let start = Instant::now();
            let outcome = match tokio::time::timeout(
                self.settings.timeout,
                self.channel.send(&notification, &recipients),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => ChannelOutcome::failed(DeliveryError::Timeout {
                    after_ms: self.settings.timeout.as_millis() as u64,
                }),
            };
            self.metrics.record_delivery_latency(start.elapsed().as_millis() as u64);

            if outcome.delivered {
                return self.settle_sent(&event, attempt, outcome.recipients_reached).await;
            }

            let error = outcome.error.unwrap_or_else(|| DeliveryError::Transport {
                message: "channel reported no delivery".to_string(),
            });
            if !error.is_retryable() || attempt >= self.settings.max_attempts {
                return self.settle_failed(&event, error, attempt).await;
            }

            let delay = backoff_delay(attempt, self.settings.backoff_initial, self.settings.backoff_max);
            self.metrics.record_delivery_retry();
            warn!(
                event_id = %id,
                attempt = %attempt,
                reason = %error.code(),
                error = %error,
                retry_in_ms = %delay.as_millis(),
                "delivery_retry"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn settle_sent(
        &self,
        event: &GeofenceEvent,
        attempts: u32,
        recipients_reached: usize,
    ) -> Option<GeofenceEvent> {
        match self.events.settle_sent(event.id, Utc::now(), attempts).await {
            Ok(settled) => {
                if settled.is_some() {
                    self.metrics.record_delivery(true);
                    info!(
                        event_id = %event.id,
                        subject_id = %event.subject_id,
                        site_id = %event.site_id,
                        kind = %event.kind.as_str(),
                        attempts = %attempts,
                        recipients_reached = %recipients_reached,
                        "delivery_sent"
                    );
                }
                settled
            }
            Err(e) => {
                log_journal_error(event, &e);
                self.events.get(event.id)
            }
        }
    }

    async fn settle_failed(
        &self,
        event: &GeofenceEvent,
        error: DeliveryError,
        attempts: u32,
    ) -> Option<GeofenceEvent> {
        let code = error.code();
        let message = error.to_string();
        match self.events.settle_failed(event.id, error, attempts).await {
            Ok(settled) => {
                if settled.is_some() {
                    self.metrics.record_delivery(false);
                    warn!(
                        event_id = %event.id,
                        subject_id = %event.subject_id,
                        site_id = %event.site_id,
                        reason = %code,
                        error = %message,
                        attempts = %attempts,
                        "delivery_failed"
                    );
                }
                settled
            }
            Err(e) => {
                log_journal_error(event, &e);
                self.events.get(event.id)
            }
        }
    }
}

#[cold]
fn log_journal_error(event: &GeofenceEvent, e: &crate::domain::error::StoreError) {
    error!(event_id = %event.id, error = %e, "delivery_outcome_journal_failed");
}
