//! Delivery channel: push when connected, HTTP polling and multipart send otherwise.
//!
//! Every inbound message, whichever path carried it, comes out of the single
//! `ChannelEvent` stream returned by [`DeliveryChannel::start`]. The same
//! message may arrive on more than one path; the reconciler drops repeats.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

use super::chat_api::ChatApi;
use super::chat_types::{OutgoingMessage, ServerMessage};
use super::push::{PushConnection, PushEvent, PushTransport, NEW_MESSAGE_EVENT, SEND_MESSAGE_EVENT};
use crate::error::{ChatError, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Wait before fetching the stored copy of a send the server did not echo back.
pub const SEND_CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Which producer delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageSource {
    Push,
    Poll,
    History,
    /// Stored message returned in the body of `POST /send_message`.
    Http,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    RemoteMessage {
        source: MessageSource,
        message: ServerMessage,
    },
    Connected,
    Disconnected {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPath {
    Push,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub path: SendPath,
    /// The HTTP response carried the stored message (already on the event stream).
    /// When false a one-shot confirmation fetch has been scheduled instead.
    pub confirmed: bool,
}

/// Connection and polling state, snapshotted by [`DeliveryChannel::state`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    pub connected: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// A poll timer is armed.
    pub polling: bool,
    pub poll_in_flight: bool,
}

struct ChannelInner {
    api: Arc<dyn ChatApi>,
    push: Option<Arc<dyn PushTransport>>,
    recipient_id: String,
    poll_interval: Duration,
    state: Mutex<DeliveryState>,
    poll_in_flight: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    confirm_fetches: Mutex<JoinSet<()>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

/// Cheap to clone; all clones drive the same channel.
#[derive(Clone)]
pub struct DeliveryChannel {
    inner: Arc<ChannelInner>,
}

impl DeliveryChannel {
    /// Start the channel for one conversation.
    ///
    /// Polling runs from the start and stops once push reports a connection.
    /// Without a push transport the channel polls for its whole lifetime.
    pub async fn start(
        api: Arc<dyn ChatApi>,
        push: Option<PushConnection>,
        recipient_id: &str,
        poll_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transport, push_events) = match push {
            Some(conn) => (Some(conn.transport), Some(conn.events)),
            None => (None, None),
        };

        let inner = Arc::new(ChannelInner {
            api,
            push: transport,
            recipient_id: recipient_id.to_string(),
            poll_interval,
            state: Mutex::new(DeliveryState::default()),
            poll_in_flight: AtomicBool::new(false),
            poll_task: Mutex::new(None),
            forwarder: Mutex::new(None),
            confirm_fetches: Mutex::new(JoinSet::new()),
            events: events_tx,
        });

        inner.start_polling().await;

        if let Some(push_events) = push_events {
            let task = tokio::spawn(Self::forward_push(inner.clone(), push_events));
            *inner.forwarder.lock().await = Some(task);
        } else {
            log::info!("Push disabled, polling every {}s", poll_interval.as_secs());
        }

        (Self { inner }, events_rx)
    }

    async fn forward_push(inner: Arc<ChannelInner>, mut push_events: mpsc::UnboundedReceiver<PushEvent>) {
        while let Some(event) = push_events.recv().await {
            match event {
                PushEvent::Connected => {
                    inner.state.lock().await.connected = true;
                    inner.stop_polling().await;
                    let _ = inner.events.send(ChannelEvent::Connected);
                }
                PushEvent::Disconnected { reason } => {
                    inner.state.lock().await.connected = false;
                    inner.start_polling().await;
                    let _ = inner.events.send(ChannelEvent::Disconnected { reason });
                }
                PushEvent::Event { name, payload } if name == NEW_MESSAGE_EVENT => {
                    match serde_json::from_value::<ServerMessage>(payload) {
                        Ok(message) => {
                            let _ = inner.events.send(ChannelEvent::RemoteMessage {
                                source: MessageSource::Push,
                                message,
                            });
                        }
                        Err(e) => log::warn!("Dropping malformed push message: {}", e),
                    }
                }
                PushEvent::Event { name, .. } => {
                    log::debug!("Ignoring push event {}", name);
                }
            }
        }
        log::debug!("Push event stream ended");
    }

    /// Send through push when connected and no attachment is present,
    /// otherwise (or when the push emit fails) through multipart HTTP.
    ///
    /// The server only pushes `new_message` to the recipient, so a send whose
    /// stored copy did not come back in the response is followed by one fetch
    /// after [`SEND_CONFIRM_DELAY`].
    pub async fn send(&self, message: &OutgoingMessage) -> Result<SendOutcome> {
        let connected = self.inner.state.lock().await.connected;
        if connected && message.attachment.is_none() {
            if let Some(push) = &self.inner.push {
                match push.emit(SEND_MESSAGE_EVENT, message.push_payload()).await {
                    Ok(()) => {
                        self.inner.schedule_confirm_fetch().await;
                        return Ok(SendOutcome {
                            path: SendPath::Push,
                            confirmed: false,
                        });
                    }
                    Err(e) => log::warn!("Push send failed, falling back to HTTP: {}", e),
                }
            }
        }

        let response = self.inner.api.send_message(message).await.map_err(|e| match e {
            failure @ ChatError::DeliveryFailure(_) => failure,
            other => ChatError::DeliveryFailure(other.to_string()),
        })?;

        let confirmed = match response.confirmed_message() {
            Some(stored) => {
                let _ = self.inner.events.send(ChannelEvent::RemoteMessage {
                    source: MessageSource::Http,
                    message: stored,
                });
                true
            }
            None => {
                self.inner.schedule_confirm_fetch().await;
                false
            }
        };
        Ok(SendOutcome {
            path: SendPath::Http,
            confirmed,
        })
    }

    /// Fetch the full conversation once, regardless of push state.
    pub async fn fetch_history(&self) -> Result<usize> {
        self.inner.poll_once(MessageSource::History).await
    }

    pub async fn state(&self) -> DeliveryState {
        let mut state = self.inner.state.lock().await.clone();
        state.poll_in_flight = self.inner.poll_in_flight.load(Ordering::SeqCst);
        state
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.connected
    }

    /// Stop the push forwarder, the poll timer and pending confirmation
    /// fetches, then close the push connection.
    pub async fn shutdown(&self) {
        // The forwarder restarts polling on disconnect, so it goes first.
        let forwarder = self.inner.forwarder.lock().await.take();
        if let Some(task) = forwarder {
            task.abort();
            let _ = task.await;
        }
        self.inner.stop_polling().await;
        self.inner.confirm_fetches.lock().await.abort_all();
        if let Some(push) = &self.inner.push {
            push.close().await;
        }
        self.inner.state.lock().await.connected = false;
        log::info!("Delivery channel shut down");
    }
}

impl ChannelInner {
    async fn start_polling(self: &Arc<Self>) {
        let mut slot = self.poll_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = self.clone();
        *slot = Some(tokio::spawn(async move { inner.poll_loop().await }));
        self.state.lock().await.polling = true;
        log::debug!("Polling started");
    }

    async fn stop_polling(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
            log::debug!("Polling stopped");
        }
        self.state.lock().await.polling = false;
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once(MessageSource::Poll).await {
                log::warn!("Poll for new messages failed: {}", e);
            }
        }
    }

    async fn schedule_confirm_fetch(self: &Arc<Self>) {
        let inner = self.clone();
        let mut pending = self.confirm_fetches.lock().await;
        while pending.try_join_next().is_some() {}
        pending.spawn(async move {
            tokio::time::sleep(SEND_CONFIRM_DELAY).await;
            match inner.poll_once(MessageSource::Poll).await {
                Ok(count) => log::debug!("Confirmation fetch returned {} messages", count),
                Err(e) => log::warn!("Confirmation fetch failed: {}", e),
            }
        });
    }

    /// One fetch. Returns 0 without fetching if another poll is still in flight.
    async fn poll_once(&self, source: MessageSource) -> Result<usize> {
        let Some(_guard) = InFlightGuard::acquire(&self.poll_in_flight) else {
            log::debug!("Previous poll still in flight, skipping");
            return Ok(0);
        };

        let result = self.api.fetch_messages(&self.recipient_id).await;
        self.state.lock().await.last_poll_at = Some(Utc::now());

        let messages = result?;
        let count = messages.len();
        for message in messages {
            let _ = self
                .events
                .send(ChannelEvent::RemoteMessage { source, message });
        }
        Ok(count)
    }
}

/// Clears the in-flight flag when the poll finishes or its task is aborted.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
