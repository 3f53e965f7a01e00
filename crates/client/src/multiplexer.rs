//! Client-side stream multiplexer
//!
//! One physical event stream, many logical subscriptions. Frames are tagged
//! with a group (the SSE event name); the JSON body carries an `eventType`.
//! A subscription is a `(group, eventType, handler)` triple.

use futures::StreamExt;
use groupcast_shared::{is_blank, ConnectionId, EventBody, CONNECTION_RESPONSE_CHANNEL};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::{MuxError, Result};
use crate::sse::SseFrame;
use crate::transport::{FrameStream, HttpTransport, Transport};

/// Connection state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; after [`Multiplexer::disconnect`] this is final
    Disconnected,
    /// Opening the event stream
    Connecting,
    /// Frames are being dispatched
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    TornDown,
}

/// Identity of one subscription, unique per multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionKey(u64);

/// Callback invoked with the decoded envelope of a matching frame
pub type Handler = Arc<dyn Fn(&EventBody) + Send + Sync>;

struct Entry {
    event_type: String,
    handler: Handler,
}

struct Pending {
    key: SubscriptionKey,
    group: String,
    entry: Entry,
}

#[derive(Default)]
struct Subscriptions {
    /// Live listeners per group; a group is present only while it has entries
    listeners: HashMap<String, BTreeMap<SubscriptionKey, Entry>>,
    /// Requested before the stream was open
    pending: Vec<Pending>,
}

impl Subscriptions {
    fn attach(&mut self, group: String, key: SubscriptionKey, entry: Entry) {
        self.listeners.entry(group).or_default().insert(key, entry);
    }

    fn remove(&mut self, group: &str, key: SubscriptionKey) -> bool {
        if let Some(pos) = self.pending.iter().position(|p| p.key == key) {
            self.pending.remove(pos);
            return true;
        }

        let Some(entries) = self.listeners.get_mut(group) else {
            return false;
        };
        let removed = entries.remove(&key).is_some();
        if entries.is_empty() {
            self.listeners.remove(group);
        }
        removed
    }

    fn is_live(&self, group: &str, key: SubscriptionKey) -> bool {
        self.listeners
            .get(group)
            .is_some_and(|entries| entries.contains_key(&key))
    }

    /// Handlers matching a frame, in registration order
    fn matching(&self, group: &str, event_type: &str) -> Vec<(SubscriptionKey, Handler)> {
        self.listeners
            .get(group)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| e.event_type == event_type)
                    .map(|(key, e)| (*key, Arc::clone(&e.handler)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear(&mut self) {
        self.listeners.clear();
        self.pending.clear();
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    phase: Mutex<Phase>,
    subscriptions: Mutex<Subscriptions>,
    next_key: AtomicU64,
    connection_id: watch::Sender<Option<ConnectionId>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn unsubscribe(&self, group: &str, key: SubscriptionKey) {
        if self.subscriptions.lock().remove(group, key) {
            tracing::debug!(group = %group, key = key.0, "Unsubscribed");
        }
    }

    /// Final transition; safe to call more than once
    fn tear_down(&self) {
        *self.phase.lock() = Phase::TornDown;
        self.subscriptions.lock().clear();
        self.connection_id.send_replace(None);
    }

    fn dispatch_frame(&self, frame: SseFrame) {
        if frame.event == CONNECTION_RESPONSE_CHANNEL {
            self.record_connection_id(&frame.data);
        }

        if !self.subscriptions.lock().listeners.contains_key(&frame.event) {
            return;
        }

        let body = match EventBody::parse(&frame.data) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    group = %frame.event,
                    error = %MuxError::Protocol(e.to_string()),
                    "Dropping malformed frame"
                );
                return;
            }
        };

        let handlers = self
            .subscriptions
            .lock()
            .matching(&frame.event, body.event_type());

        for (key, handler) in handlers {
            // An earlier handler may have unsubscribed this one
            if !self.subscriptions.lock().is_live(&frame.event, key) {
                continue;
            }

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&body))) {
                tracing::error!(
                    group = %frame.event,
                    event_type = %body.event_type(),
                    key = key.0,
                    panic = %panic_message(panic.as_ref()),
                    "Subscription handler panicked"
                );
            }
        }
    }

    fn record_connection_id(&self, data: &str) {
        let id = EventBody::parse(data).ok().and_then(|body| {
            body.data()
                .get("connectionId")
                .and_then(|v| v.as_str())
                .map(ConnectionId::from)
        });

        match id {
            Some(id) => {
                tracing::info!(connection_id = %id, "Connection established");
                self.connection_id.send_replace(Some(id));
            }
            None => {
                tracing::warn!("ConnectionResponse frame without a connectionId");
            }
        }
    }
}

impl Drop for Inner {
    /// Last handle gone: stop reading so the stream is closed
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.get_mut().take() {
            dispatch.abort();
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_dispatch(inner: Weak<Inner>, mut frames: FrameStream) {
    while let Some(item) = frames.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(frame) => inner.dispatch_frame(frame),
            Err(e) => {
                tracing::warn!(error = %e, "Event stream failed");
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        if inner.phase() != Phase::TornDown {
            tracing::warn!("Event stream ended by server, multiplexer disconnected");
            inner.tear_down();
        }
    }
}

/// A registered `(group, eventType)` handler
pub struct Subscription {
    key: SubscriptionKey,
    group: String,
    event_type: String,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn key(&self) -> SubscriptionKey {
        self.key
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove this handler only; the group listener goes once nothing uses it.
    /// Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.group, self.key);
        }
    }
}

/// Demultiplexes one event stream into per-group, per-event-type handlers.
///
/// Cheap to clone; clones share the same stream and subscriptions.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Multiplexer over SSE/HTTP
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(Arc::new(HttpTransport::new(config)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let (connection_id, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                transport,
                phase: Mutex::new(Phase::Idle),
                subscriptions: Mutex::new(Subscriptions::default()),
                next_key: AtomicU64::new(1),
                connection_id,
                dispatch: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.phase() {
            Phase::Idle | Phase::TornDown => ConnectionState::Disconnected,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Connected => ConnectionState::Connected,
        }
    }

    /// True once the multiplexer can no longer be used
    pub fn is_disconnected(&self) -> bool {
        self.inner.phase() == Phase::TornDown
    }

    /// Open the event stream and start dispatching.
    ///
    /// Subscriptions made before this call are attached once the stream is
    /// open. A failed open leaves the multiplexer usable for another attempt.
    pub async fn connect(&self, endpoint: &str) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::TornDown => {
                    return Err(MuxError::Lifecycle("cannot connect after disconnect".into()))
                }
                Phase::Connecting | Phase::Connected => {
                    return Err(MuxError::Validation("already connected".into()))
                }
                Phase::Idle => *phase = Phase::Connecting,
            }
        }

        let frames = match self.inner.transport.open(endpoint).await {
            Ok(frames) => frames,
            Err(e) => {
                let mut phase = self.inner.phase.lock();
                if *phase == Phase::Connecting {
                    *phase = Phase::Idle;
                }
                tracing::warn!(endpoint = %endpoint, error = %e, "Failed to open event stream");
                return Err(e);
            }
        };

        {
            let mut phase = self.inner.phase.lock();
            if *phase == Phase::TornDown {
                return Err(MuxError::Lifecycle("disconnected while connecting".into()));
            }

            let mut subscriptions = self.inner.subscriptions.lock();
            let pending = std::mem::take(&mut subscriptions.pending);
            let flushed = pending.len();
            for Pending { key, group, entry } in pending {
                subscriptions.attach(group, key, entry);
            }
            drop(subscriptions);

            *phase = Phase::Connected;
            let dispatch = tokio::spawn(run_dispatch(Arc::downgrade(&self.inner), frames));
            *self.inner.dispatch.lock() = Some(dispatch);

            tracing::info!(endpoint = %endpoint, flushed, "Multiplexer connected");
        }

        Ok(())
    }

    /// Register `handler` for frames on `group` whose body has `event_type`
    pub fn on<F>(&self, group: &str, event_type: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&EventBody) + Send + Sync + 'static,
    {
        if is_blank(group) {
            return Err(MuxError::Validation("group is required".into()));
        }
        if is_blank(event_type) {
            return Err(MuxError::Validation("event type is required".into()));
        }

        let key = SubscriptionKey(self.inner.next_key.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            event_type: event_type.to_string(),
            handler: Arc::new(handler),
        };

        {
            let phase = self.inner.phase.lock();
            let mut subscriptions = self.inner.subscriptions.lock();
            match *phase {
                Phase::TornDown => {
                    return Err(MuxError::Lifecycle("cannot subscribe after disconnect".into()))
                }
                Phase::Idle | Phase::Connecting => subscriptions.pending.push(Pending {
                    key,
                    group: group.to_string(),
                    entry,
                }),
                Phase::Connected => subscriptions.attach(group.to_string(), key, entry),
            }
        }

        tracing::debug!(group = %group, event_type = %event_type, key = key.0, "Subscribed");

        Ok(Subscription {
            key,
            group: group.to_string(),
            event_type: event_type.to_string(),
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Like [`on`](Self::on), but decodes the body into `T` first.
    ///
    /// A body that does not decode is logged and skipped for this handler.
    pub fn on_typed<T, F>(&self, group: &str, event_type: &str, handler: F) -> Result<Subscription>
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let group_name = group.to_string();
        self.on(group, event_type, move |body| match body.decode::<T>() {
            Ok(value) => handler(value),
            Err(e) => tracing::warn!(
                group = %group_name,
                event_type = %body.event_type(),
                error = %MuxError::Protocol(e.to_string()),
                "Dropping frame that does not match the expected shape"
            ),
        })
    }

    /// Close the stream and drop every subscription. Final and idempotent.
    pub fn disconnect(&self) {
        let was = self.inner.phase();
        self.inner.tear_down();
        if let Some(dispatch) = self.inner.dispatch.lock().take() {
            dispatch.abort();
        }
        if was != Phase::TornDown {
            tracing::info!("Multiplexer disconnected");
        }
    }

    /// Id the server assigned to this connection, once known
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.connection_id.borrow().clone()
    }

    /// Wait for the server to announce the connection id
    pub async fn wait_for_connection_id(&self) -> Result<ConnectionId> {
        let mut rx = self.inner.connection_id.subscribe();
        loop {
            if let Some(id) = rx.borrow_and_update().clone() {
                return Ok(id);
            }
            if self.is_disconnected() {
                return Err(MuxError::Lifecycle("disconnected before a connection id arrived".into()));
            }
            if rx.changed().await.is_err() {
                return Err(MuxError::Lifecycle("multiplexer dropped".into()));
            }
        }
    }

    /// Groups with a live listener
    pub fn listener_count(&self) -> usize {
        self.inner.subscriptions.lock().listeners.len()
    }

    /// Live (attached) subscriptions across all groups
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .listeners
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    /// Subscriptions waiting for the stream to open
    pub fn pending_count(&self) -> usize {
        self.inner.subscriptions.lock().pending.len()
    }
}
