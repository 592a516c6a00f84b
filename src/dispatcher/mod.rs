//! Dispatcher: fans inbound bridge records out to local subscriptions.
//!
//! One background task owns the receive side of a [`BridgeClient`] and
//! delivers every inbound record to each subscription registered for its
//! address. Remote registration is reference counted: the first local
//! subscription for an address sends `register`, the last removal sends
//! `unregister`.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start()──► Running ──stop() / first receive error──► Stopped
//! ```
//!
//! `Stopped` is terminal. The first error seen by the receive loop (or the
//! keepalive task) is kept in a single slot; later errors are dropped.
//!
//! # Known limitation
//!
//! The stop flag is checked between reads. A `receive()` already waiting
//! for a frame returns only when a record arrives or the client is closed.

mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::{BridgeClient, BridgeError, Message};
use registry::{DeliverySlot, Registry, Removal};

/// Dispatcher lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Constructed, receive loop not started.
    Idle,
    /// Receive loop active.
    Running,
    /// Terminal: stopped explicitly or after an unrecoverable error.
    Stopped,
}

impl DispatcherState {
    /// Lowercase state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// A local subscription to one address.
///
/// `receiver` yields every record delivered to `address` until the
/// subscription is unregistered or the dispatcher stops, then `None`.
#[derive(Debug)]
pub struct Subscription {
    /// Unique subscription id, needed for [`Dispatcher::unregister`].
    pub id: String,
    /// Address this subscription listens on.
    pub address: String,
    /// Delivery queue.
    pub receiver: mpsc::Receiver<Arc<Message>>,
}

impl Subscription {
    /// Wait for the next record, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.recv().await
    }
}

/// State shared between the dispatcher handle and its background tasks.
#[derive(Debug)]
struct Shared {
    /// Held only for map lookups and mutations, never across an await.
    registry: Mutex<Registry>,
    state: Mutex<DispatcherState>,
    stop_requested: AtomicBool,
    /// Single-slot error notification. Written at most once.
    error_tx: watch::Sender<Option<Arc<BridgeError>>>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn is_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.set_state(DispatcherState::Stopped);
    }

    /// Stop after an unrecoverable error: keep the error, close every queue.
    fn fail(&self, error: BridgeError) {
        self.report_error(error);
        self.request_stop();
        let closed = self.registry().drain_all();
        log::debug!("[Dispatcher] Closed {closed} subscription(s) after failure");
    }

    /// Store `error` unless one is already stored. Returns `true` if stored.
    fn report_error(&self, error: BridgeError) -> bool {
        let error = Arc::new(error);
        self.error_tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(error);
            true
        })
    }

    fn fan_out(&self, message: Message) -> usize {
        let message = Arc::new(message);
        self.registry().deliver(&message)
    }
}

/// Demultiplexes one bridge connection across many local subscriptions.
///
/// Share the same `Arc<BridgeClient>` with code that sends or publishes;
/// the dispatcher is the connection's only reader once started.
pub struct Dispatcher<S = TcpStream> {
    client: Arc<BridgeClient<S>>,
    shared: Arc<Shared>,
    /// Serializes register/unregister so first/last remote calls stay in
    /// step with the registry. Held across the remote write.
    control: tokio::sync::Mutex<()>,
    ping_interval: Option<Duration>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl<S> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client", &self.client)
            .field("state", &self.shared.state())
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

impl<S> Dispatcher<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create an idle dispatcher over `client`.
    pub fn new(client: Arc<BridgeClient<S>>) -> Self {
        let (error_tx, _) = watch::channel(None);
        Self {
            client,
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                state: Mutex::new(DispatcherState::Idle),
                stop_requested: AtomicBool::new(false),
                error_tx,
            }),
            control: tokio::sync::Mutex::new(()),
            ping_interval: None,
            keepalive: Mutex::new(None),
        }
    }

    /// Send a keepalive ping every `interval` while running.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }

    /// The client this dispatcher reads from.
    pub fn client(&self) -> &Arc<BridgeClient<S>> {
        &self.client
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Number of local subscriptions on `address`.
    pub fn subscription_count(&self, address: &str) -> usize {
        self.shared.registry().subscription_count(address)
    }

    /// The error that stopped the dispatcher, if any.
    pub fn error(&self) -> Option<Arc<BridgeError>> {
        self.shared.error_tx.borrow().clone()
    }

    /// Wait until an error is reported.
    ///
    /// Returns immediately if one already has been. By the time the error is
    /// visible the dispatcher is stopping and every subscription queue has
    /// been closed.
    pub async fn wait_for_error(&self) -> Option<Arc<BridgeError>> {
        let mut rx = self.shared.error_tx.subscribe();
        let error = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        error
    }

    /// Start the background receive loop (and keepalive, if configured).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidState`] unless the dispatcher is idle.
    pub fn start(&self) -> Result<(), BridgeError> {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != DispatcherState::Idle {
                return Err(BridgeError::InvalidState {
                    operation: "start",
                    state: state.as_str(),
                });
            }
            *state = DispatcherState::Running;
        }

        log::info!("[Dispatcher] Starting receive loop for {}", self.client.peer());
        // Detached: stop() does not interrupt an in-flight receive.
        tokio::spawn(receive_loop(Arc::clone(&self.client), Arc::clone(&self.shared)));

        if let Some(interval) = self.ping_interval {
            let handle = tokio::spawn(keepalive_loop(
                Arc::clone(&self.client),
                Arc::clone(&self.shared),
                interval,
            ));
            *self.keepalive.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        Ok(())
    }

    /// Subscribe to `address` with a delivery queue of `queue_capacity`.
    ///
    /// The first subscription for an address registers it with the bridge
    /// before the subscription is admitted. A capacity of 0 is treated as 1.
    ///
    /// # Errors
    ///
    /// Returns the remote registration error (with no local state left
    /// behind), or [`BridgeError::InvalidState`] once stopped.
    pub async fn register(
        &self,
        address: &str,
        queue_capacity: usize,
    ) -> Result<Subscription, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (queue_tx, receiver) = mpsc::channel(queue_capacity.max(1));

        let _control = self.control.lock().await;
        self.ensure_not_stopped("register")?;

        let first = !self.shared.registry().contains(address);
        if first {
            self.client.register(address).await?;
            log::info!("[Dispatcher] Registered {address:?} with bridge");
        }

        {
            let mut registry = self.shared.registry();
            // stop() raises the flag before draining under this lock.
            if self.shared.is_stopping() {
                return Err(BridgeError::InvalidState {
                    operation: "register",
                    state: DispatcherState::Stopped.as_str(),
                });
            }
            registry.insert(address, id.clone(), DeliverySlot::spawn(id.clone(), queue_tx));
        }

        log::debug!("[Dispatcher] Subscription {id} added on {address:?}");
        Ok(Subscription {
            id,
            address: address.to_string(),
            receiver,
        })
    }

    /// Remove a subscription and close its queue.
    ///
    /// Unknown (address, id) pairs are a no-op. Removing the last
    /// subscription on an address unregisters it with the bridge.
    ///
    /// # Errors
    ///
    /// Returns the remote unregistration error. The local subscription is
    /// already gone when that happens.
    pub async fn unregister(&self, address: &str, subscription_id: &str) -> Result<(), BridgeError> {
        let _control = self.control.lock().await;

        let removal = self.shared.registry().remove(address, subscription_id);
        match removal {
            Removal::NotFound => Ok(()),
            Removal::Removed { remaining: 0 } => {
                log::debug!("[Dispatcher] Subscription {subscription_id} removed from {address:?}");
                self.client.unregister(address).await?;
                log::info!("[Dispatcher] Unregistered {address:?} with bridge");
                Ok(())
            }
            Removal::Removed { remaining } => {
                log::debug!(
                    "[Dispatcher] Subscription {subscription_id} removed from {address:?} ({remaining} left)"
                );
                Ok(())
            }
        }
    }

    /// Send `body` to `address` and wait for the reply.
    ///
    /// The reply address is fresh for each call and is routed through the
    /// registry as a local one-shot subscription; it is never registered
    /// with the bridge, which delivers replies without one. The slot is
    /// removed when the reply arrives, on timeout, or if this future is
    /// dropped. `err` replies are returned like any other record; check
    /// [`Message::is_error`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Timeout`] if nothing arrives within `timeout`,
    /// [`BridgeError::InvalidState`] unless the dispatcher is running (or if
    /// it stops while waiting), or the send error.
    pub async fn request<B>(
        &self,
        address: &str,
        headers: Option<Value>,
        body: &B,
        timeout: Duration,
    ) -> Result<Arc<Message>, BridgeError>
    where
        B: Serialize + ?Sized,
    {
        let reply_address = uuid::Uuid::new_v4().to_string();
        let id = uuid::Uuid::new_v4().to_string();
        let (queue_tx, mut replies) = mpsc::channel(1);

        {
            let mut registry = self.shared.registry();
            let state = self.shared.state();
            if state != DispatcherState::Running {
                return Err(BridgeError::InvalidState {
                    operation: "request",
                    state: state.as_str(),
                });
            }
            registry.insert(&reply_address, id.clone(), DeliverySlot::spawn(id.clone(), queue_tx));
        }
        let _slot = ReplySlot {
            shared: &self.shared,
            reply_address: reply_address.clone(),
            id,
        };

        self.client.send_with_reply(address, &reply_address, headers, body).await?;
        log::debug!("[Dispatcher] Awaiting reply from {address:?} on {reply_address}");

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BridgeError::InvalidState {
                operation: "request",
                state: DispatcherState::Stopped.as_str(),
            }),
            Err(_) => {
                log::debug!("[Dispatcher] Request to {address:?} timed out after {timeout:?}");
                Err(BridgeError::Timeout {
                    address: address.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Stop the dispatcher and close every subscription queue.
    ///
    /// Does not unregister anything with the bridge. Returns the number of
    /// subscriptions closed.
    pub fn stop(&self) -> usize {
        self.shared.request_stop();

        if let Some(handle) = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }

        let closed = self.shared.registry().drain_all();
        log::info!("[Dispatcher] Stopped, closed {closed} subscription(s)");
        closed
    }

    fn ensure_not_stopped(&self, operation: &'static str) -> Result<(), BridgeError> {
        let state = self.shared.state();
        if state == DispatcherState::Stopped {
            return Err(BridgeError::InvalidState {
                operation,
                state: state.as_str(),
            });
        }
        Ok(())
    }
}

impl<S> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.keepalive.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.shared.registry().drain_all();
    }
}

/// Registry entry for one pending request. Removed on drop.
struct ReplySlot<'a> {
    shared: &'a Shared,
    reply_address: String,
    id: String,
}

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        self.shared.registry().remove(&self.reply_address, &self.id);
    }
}

/// Read records and fan them out until stopped or failed.
async fn receive_loop<S>(client: Arc<BridgeClient<S>>, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        if shared.is_stopping() {
            log::info!("[Dispatcher] Receive loop exiting on stop");
            break;
        }

        match client.receive().await {
            Ok(message) => {
                let kind = message.kind;
                let address = message.address.clone();
                let delivered = shared.fan_out(message);
                if delivered == 0 {
                    log::trace!("[Dispatcher] No subscribers for {kind} on {address:?}");
                } else {
                    log::trace!("[Dispatcher] Delivered {kind} on {address:?} to {delivered}");
                }
            }
            Err(e) => {
                if shared.is_stopping() {
                    log::debug!("[Dispatcher] Receive ended after stop: {e}");
                } else {
                    log::error!("[Dispatcher] Receive failed, stopping: {e}");
                    shared.fail(e);
                }
                break;
            }
        }
    }
    shared.set_state(DispatcherState::Stopped);
}

/// Ping the bridge at a fixed interval until stopped or a ping fails.
async fn keepalive_loop<S>(client: Arc<BridgeClient<S>>, shared: Arc<Shared>, interval: Duration)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shared.is_stopping() {
            break;
        }
        if let Err(e) = client.ping().await {
            log::warn!("[Dispatcher] Keepalive ping failed, stopping: {e}");
            shared.fail(e);
            break;
        }
    }
}
