//! Node-originated events and the bot-side event fan-out.
//!
//! Frames arriving from a node are decoded into [`NodeEvent`], a closed set
//! of the kinds this client acts on plus an opaque passthrough for everything
//! else. The [`EventDispatcher`] re-emits resolved events to bot-side
//! subscribers and backs the coordinator's confirmation waits.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::id::guild_id_from_payload;
use crate::{AudioError, ChannelId, GuildId, Session};

//------------------------------------
// Event names
//------------------------------------
pub const VC_CREATED: &str = "VC_CREATED";
pub const VC_DESTROYED: &str = "VC_DESTROYED";
pub const SOURCE_START: &str = "SOURCE_START";
pub const SOURCE_STOP: &str = "SOURCE_STOP";
pub const RESUMED: &str = "RESUMED";

/// Capacity of the dispatcher's broadcast channel. Waiters that fall behind
/// skip events (`RecvError::Lagged`) and keep going.
const BROADCAST_CAPACITY: usize = 256;

/// One wire frame, in either direction: an event/op name plus a JSON body.
#[derive(Clone, Debug, serde::Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "t")]
    pub name: String,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl Frame {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// A decoded node event.
///
/// Only the variants the client itself reacts to are typed; anything else is
/// carried through untouched so subscribers still see it.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// The node confirmed a voice session now exists for the guild.
    VcCreated { guild_id: GuildId, data: Value },
    /// The node tore a guild's voice session down.
    VcDestroyed { guild_id: GuildId, data: Value },
    /// A source began playing.
    SourceStart { guild_id: GuildId, data: Value },
    /// A source stopped playing.
    SourceStop { guild_id: GuildId, data: Value },
    /// The node re-established its connection and reports the sessions it
    /// still carries.
    Resumed(ResumedState),
    /// Anything this client does not interpret. Re-dispatched as-is when the
    /// body names a guild with a live session.
    Unknown { name: String, data: Value },
}

/// Body of a [`NodeEvent::Resumed`] event.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ResumedState {
    /// Guild id (as a string key) to the surviving voice-client state.
    #[serde(default)]
    pub voice_clients: HashMap<String, ResumedVoiceClient>,
}

/// Per-guild state reported on resume.
#[derive(Clone, Debug, Deserialize)]
pub struct ResumedVoiceClient {
    #[serde(default)]
    pub channel: Option<ChannelId>,
}

impl NodeEvent {
    /// Decode a frame into a typed event.
    ///
    /// A recognized name whose body is missing the fields the client needs
    /// (e.g. a `VC_CREATED` without a guild id) degrades to
    /// [`NodeEvent::Unknown`] rather than being dropped.
    #[must_use]
    pub fn from_frame(frame: Frame) -> Self {
        let Frame { name, data } = frame;
        match name.as_str() {
            VC_CREATED | VC_DESTROYED | SOURCE_START | SOURCE_STOP => {
                match guild_id_from_payload(&data) {
                    Some(guild_id) => match name.as_str() {
                        VC_CREATED => NodeEvent::VcCreated { guild_id, data },
                        VC_DESTROYED => NodeEvent::VcDestroyed { guild_id, data },
                        SOURCE_START => NodeEvent::SourceStart { guild_id, data },
                        _ => NodeEvent::SourceStop { guild_id, data },
                    },
                    None => NodeEvent::Unknown { name, data },
                }
            }
            RESUMED => match serde_json::from_value::<ResumedState>(data.clone()) {
                Ok(state) => NodeEvent::Resumed(state),
                Err(_) => NodeEvent::Unknown { name, data },
            },
            _ => NodeEvent::Unknown { name, data },
        }
    }
}

/// An event resolved to its live session, as handed to subscribers.
#[derive(Clone, Debug)]
pub struct DispatchedEvent {
    pub name: String,
    pub session: Session,
    pub payload: Value,
}

/// Handle returned by [`EventDispatcher::on`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(Session, Value) -> BoxFuture<'static, ()> + Send + Sync>;

struct DispatcherInner {
    tx: broadcast::Sender<DispatchedEvent>,
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    next_handler_id: AtomicU64,
}

/// Bot-side event fan-out.
///
/// Subscribers register per event name; dispatch runs them one after another
/// so events for the same guild keep the order the node emitted them in.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

/// Implement [`Default`] for [`EventDispatcher`].
impl Default for EventDispatcher {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                tx,
                handlers: DashMap::new(),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to an event name.
    ///
    /// The handler receives the resolved session and the raw event body.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Session, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |session, payload| Box::pin(handler(session, payload)));
        self.inner
            .handlers
            .entry(name.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a previously registered handler. Returns whether it was found.
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        match self.inner.handlers.get_mut(name) {
            Some(mut handlers) => {
                let before = handlers.len();
                handlers.retain(|(handler_id, _)| *handler_id != id);
                handlers.len() != before
            }
            None => false,
        }
    }

    /// Deliver an event to the one-shot waiters and every subscribed handler,
    /// sequentially.
    pub async fn dispatch(&self, name: &str, session: Session, payload: Value) {
        let event = DispatchedEvent {
            name: name.to_owned(),
            session,
            payload,
        };
        // No waiters is fine.
        let _ = self.inner.tx.send(event.clone());

        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .get(name)
            .map(|entry| entry.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(event.session.clone(), event.payload.clone()).await;
        }
    }

    /// Wait for one event matching `predicate`, bounded by `timeout`.
    ///
    /// The subscription is taken out *before* the returned future is awaited,
    /// so the caller can subscribe, fire the triggering call, and only then
    /// await — an event arriving in between is not lost.
    ///
    /// # Errors
    /// Resolves to [`AudioError::Timeout`] if nothing matches in time.
    pub fn wait_for<P>(
        &self,
        name: &str,
        mut predicate: P,
        timeout: Duration,
    ) -> impl Future<Output = Result<(Session, Value), AudioError>> + Send
    where
        P: FnMut(&Session, &Value) -> bool + Send + 'static,
    {
        let mut rx = self.inner.tx.subscribe();
        let name = name.to_owned();
        async move {
            let matched = tokio::time::timeout(timeout, async {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if event.name == name && predicate(&event.session, &event.payload) {
                                return Some((event.session, event.payload));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event waiter lagged behind dispatch");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            })
            .await;

            match matched {
                Ok(Some(hit)) => Ok(hit),
                _ => Err(AudioError::Timeout(name)),
            }
        }
    }
}
