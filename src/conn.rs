use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::events::{ConnectionStatus, GatewayAction, GatewayEvent, SessionEvent};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

type EventHandler = Box<dyn Fn(&SessionEvent) + Send + Sync>;
type HandlerRegistry = Arc<StdMutex<Vec<(u64, EventHandler)>>>;

/// Handle returned by [`ConnectionManager::subscribe`]. Call
/// [`unsubscribe`](Subscription::unsubscribe) to deregister; dropping the
/// handle leaves the subscription in place.
pub struct Subscription {
    id: u64,
    registry: HandlerRegistry,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Ok(mut entries) = self.registry.lock() {
            entries.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Owns the single realtime connection of a session.
///
/// The manager is the only component that touches the transport; everything
/// else reads the lifecycle via [`status`](Self::status) or a subscription
/// and writes via [`send`](Self::send). On unexpected transport closure it
/// reopens the channel with a fixed delay, a bounded number of times, then
/// settles in the terminal error state until [`open`](Self::open) is called
/// again. Linking failures are terminal immediately: they require a fresh
/// pairing ceremony, not a transport retry.
pub struct ConnectionManager {
    config: ClientConfig,
    transport_factory: Arc<dyn TransportFactory>,
    transport: Mutex<Option<Arc<dyn Transport>>>,

    status_tx: watch::Sender<ConnectionStatus>,
    handlers: HandlerRegistry,
    handler_seq: AtomicU64,

    run_task: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
    expected_disconnect: AtomicBool,
    fatal: AtomicBool,
    reconnect_errors: AtomicU32,
    shutdown: Notify,

    last_error: StdMutex<Option<String>>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, transport_factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new(Self {
            config,
            transport_factory,
            transport: Mutex::new(None),
            status_tx,
            handlers: Arc::new(StdMutex::new(Vec::new())),
            handler_seq: AtomicU64::new(0),
            run_task: Mutex::new(None),
            is_running: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            reconnect_errors: AtomicU32::new(0),
            shutdown: Notify::new(),
            last_error: StdMutex::new(None),
        })
    }

    /// Current lifecycle value, synchronously.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// A watch receiver for awaiting status transitions.
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// The most recent connection-level error message, for the
    /// `(status, last_error)` display pair.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Registers a callback invoked on every status change and on every raw
    /// inbound event, in registration order.
    ///
    /// Callbacks run inline on the connection task and must not call
    /// `subscribe`, `unsubscribe` or `close` on this manager.
    pub fn subscribe(
        &self,
        handler: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.handler_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut entries) = self.handlers.lock() {
            entries.push((id, Box::new(handler)));
        }
        Subscription {
            id,
            registry: self.handlers.clone(),
        }
    }

    /// Establishes the channel and starts listening. Idempotent: a no-op
    /// while the connection task is already running.
    pub async fn open(self: &Arc<Self>) {
        let mut task = self.run_task.lock().await;
        if let Some(handle) = task.as_ref()
            && !handle.is_finished()
        {
            debug!(target: "Conn", "open() called while already running");
            return;
        }

        self.expected_disconnect.store(false, Ordering::Relaxed);
        self.fatal.store(false, Ordering::Relaxed);
        self.reconnect_errors.store(0, Ordering::Relaxed);

        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run_loop().await }));
    }

    /// Tears down the channel, cancels any pending reopen attempt and clears
    /// listener registrations. Idempotent.
    pub async fn close(&self) {
        self.expected_disconnect.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
        self.teardown_transport().await;

        let task = self.run_task.lock().await.take();
        if let Some(handle) = task {
            let _ = handle.await;
        }

        if let Ok(mut entries) = self.handlers.lock() {
            entries.clear();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Serializes an action onto the channel.
    pub async fn send(&self, action: &GatewayAction) -> Result<(), ClientError> {
        let transport = self
            .transport
            .lock()
            .await
            .as_ref()
            .ok_or(ClientError::NotConnected)?
            .clone();
        let frame = serde_json::to_string(action)?;
        transport.send(&frame).await.map_err(ClientError::Transport)
    }

    async fn run_loop(self: Arc<Self>) {
        let running_flag = self.clone();
        running_flag.is_running.store(true, Ordering::Relaxed);
        let _running_guard = scopeguard::guard((), move |_| {
            running_flag.is_running.store(false, Ordering::Relaxed);
        });

        loop {
            if self.expected_disconnect.load(Ordering::Relaxed) {
                self.set_status(ConnectionStatus::Disconnected);
                break;
            }
            self.set_status(ConnectionStatus::Connecting);

            match self.transport_factory.create_transport().await {
                Ok((transport, events)) => {
                    *self.transport.lock().await = Some(transport);
                    self.read_loop(events).await;
                    self.teardown_transport().await;

                    if self.fatal.load(Ordering::Relaxed) {
                        break;
                    }
                    if self.expected_disconnect.load(Ordering::Relaxed) {
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                    warn!(target: "Conn", "Transport closed unexpectedly");
                    self.set_status(ConnectionStatus::Disconnected);
                }
                Err(e) => {
                    warn!(target: "Conn", "Connect failed: {e}");
                    self.record_error(e.to_string());
                    if self.expected_disconnect.load(Ordering::Relaxed) {
                        self.set_status(ConnectionStatus::Disconnected);
                        break;
                    }
                }
            }

            let attempt = self.reconnect_errors.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(
                    target: "Conn",
                    "Reopen attempts exhausted ({}), giving up",
                    self.config.max_reconnect_attempts
                );
                self.set_status(ConnectionStatus::Error);
                break;
            }
            info!(
                target: "Conn",
                "Will reopen in {:?} (attempt {attempt}/{})",
                self.config.reconnect_delay,
                self.config.max_reconnect_attempts
            );
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.notified() => {
                    self.set_status(ConnectionStatus::Disconnected);
                    break;
                }
            }
        }
        debug!(target: "Conn", "Run loop exited");
    }

    async fn read_loop(&self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        debug!(target: "Conn", "Transport connected");
                    }
                    Some(TransportEvent::TextReceived(frame)) => {
                        self.handle_frame(&frame);
                        if self.fatal.load(Ordering::Relaxed) {
                            return;
                        }
                    }
                    Some(TransportEvent::Closed) | None => {
                        debug!(target: "Conn", "Transport event stream ended");
                        return;
                    }
                },
                _ = self.shutdown.notified() => {
                    debug!(target: "Conn", "Shutdown signaled, leaving read loop");
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: &str) {
        let event: GatewayEvent = match serde_json::from_str(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(target: "Conn/Recv", "Dropping undecodable frame: {e}");
                return;
            }
        };
        self.apply_event(&event);
        self.dispatch(&SessionEvent::Gateway(event));
    }

    fn apply_event(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::Qr(_) => {
                info!(target: "Conn/Recv", "Link challenge received");
                self.set_status(ConnectionStatus::AwaitingLink);
            }
            GatewayEvent::Authenticated => {
                self.reconnect_errors.store(0, Ordering::Relaxed);
                self.set_status(ConnectionStatus::Authenticated);
            }
            GatewayEvent::Ready(info) => {
                debug!(target: "Conn/Recv", "Channel ready: {}", info.message);
                self.reconnect_errors.store(0, Ordering::Relaxed);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = None;
                }
                self.set_status(ConnectionStatus::Ready);
            }
            GatewayEvent::AuthFailure(msg) => {
                error!(target: "Conn/Recv", "Linking rejected: {msg}");
                self.record_error(format!("authentication failed: {msg}"));
                self.fatal.store(true, Ordering::Relaxed);
                self.set_status(ConnectionStatus::Error);
            }
            GatewayEvent::Disconnected(reason) => {
                warn!(target: "Conn/Recv", "Upstream channel closed: {reason}");
                self.record_error(format!("disconnected: {reason}"));
                self.set_status(ConnectionStatus::Disconnected);
            }
            GatewayEvent::Error(info) => {
                // Severity depends on where the session is: before the
                // channel confirmed open this aborts the linking ceremony,
                // afterwards it is a gateway-side hiccup surfaced to
                // subscribers.
                self.record_error(info.message.clone());
                if self.status() == ConnectionStatus::Ready {
                    warn!(target: "Conn/Recv", "Gateway error: {}", info.message);
                } else {
                    error!(target: "Conn/Recv", "Fatal gateway error: {}", info.message);
                    self.fatal.store(true, Ordering::Relaxed);
                    self.set_status(ConnectionStatus::Error);
                }
            }
            GatewayEvent::Message(_)
            | GatewayEvent::MessageSent(_)
            | GatewayEvent::ChatsList(_) => {}
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if changed {
            info!(target: "Conn", "Status -> {status}");
            self.dispatch(&SessionEvent::StatusChanged(status));
        }
    }

    fn dispatch(&self, event: &SessionEvent) {
        if let Ok(entries) = self.handlers.lock() {
            for (_, handler) in entries.iter() {
                handler(event);
            }
        }
    }

    fn record_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    async fn teardown_transport(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }
}
