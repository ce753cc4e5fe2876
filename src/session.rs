//! Voice sessions: the live binding between a guild's voice channel and the
//! node serving it.

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt::{self, Display};
use std::sync::{Arc, Weak};

use crate::{AudioError, ChannelId, Frame, GuildId, Node};

//------------------------------------
// Frame ops understood by the node
//------------------------------------
const OP_SKIP: &str = "SKIP";
const OP_SEEK: &str = "SEEK";
const OP_PAUSE: &str = "PAUSE";
const OP_RESUME: &str = "RESUME";
const OP_SET_VOLUME: &str = "SET_VOLUME";
const OP_SET_CONTEXT: &str = "SET_CONTEXT";
const OP_VC_DESTROY: &str = "VC_DESTROY";

/// Metadata of a source the node resolved. Playback itself never leaves the
/// node; this is what the bot shows to people.
#[derive(Clone, Debug, Deserialize)]
pub struct AudioSource {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub webpage_url: String,
    /// Seconds, absent for live streams.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Everything else the node reported.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of a load: a single source or a whole playlist.
#[derive(Clone, Debug)]
pub enum Loaded {
    Single(Box<AudioSource>),
    Playlist(Vec<AudioSource>),
}

impl Loaded {
    /// The source that will play first.
    #[must_use]
    pub fn first(&self) -> Option<&AudioSource> {
        match self {
            Loaded::Single(source) => Some(source),
            Loaded::Playlist(sources) => sources.first(),
        }
    }

    /// How many sources were loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Loaded::Single(_) => 1,
            Loaded::Playlist(sources) => sources.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_body(body: Value) -> Result<Self, AudioError> {
        if let Some(source) = body.get("source") {
            let source: AudioSource = serde_json::from_value(source.clone())?;
            return Ok(Loaded::Single(Box::new(source)));
        }
        if let Some(sources) = body.get("sources") {
            let sources: Vec<AudioSource> = serde_json::from_value(sources.clone())?;
            return Ok(Loaded::Playlist(sources));
        }
        Err(AudioError::UnexpectedResponse(
            "load response carried neither `source` nor `sources`".to_owned(),
        ))
    }
}

struct SessionInner {
    guild_id: GuildId,
    channel_id: RwLock<Option<ChannelId>>,
    node: Weak<Node>,
    /// Caller-owned scratch space (e.g. the text channel to post now-playing
    /// messages to). Mirrored to the node on [`Session::set_context`].
    context: RwLock<Map<String, Value>>,
}

/// Handle to one guild's voice session. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(guild_id: GuildId, channel_id: Option<ChannelId>, node: &Arc<Node>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                guild_id,
                channel_id: RwLock::new(channel_id),
                node: Arc::downgrade(node),
                context: RwLock::new(Map::new()),
            }),
        }
    }

    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.inner.guild_id
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<ChannelId> {
        *self.inner.channel_id.read()
    }

    /// The node hosting this session.
    ///
    /// # Errors
    /// Returns [`AudioError::NodeUnavailable`] if the node is gone.
    pub fn node(&self) -> Result<Arc<Node>, AudioError> {
        self.inner.node.upgrade().ok_or(AudioError::NodeUnavailable)
    }

    /// Whether this session lives on the given node.
    #[must_use]
    pub fn is_on(&self, node: &Node) -> bool {
        self.inner
            .node
            .upgrade()
            .is_some_and(|own| own.id() == node.id())
    }

    /// A copy of the session's context blob.
    #[must_use]
    pub fn context(&self) -> Map<String, Value> {
        self.inner.context.read().clone()
    }

    /// One value out of the context blob.
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.inner.context.read().get(key).cloned()
    }

    /// Replace the context blob locally and mirror it to the node.
    ///
    /// # Errors
    /// Transport failures; the local copy is updated regardless.
    pub async fn set_context(&self, context: Map<String, Value>) -> Result<(), AudioError> {
        *self.inner.context.write() = context.clone();
        self.send(OP_SET_CONTEXT, json!({ "context": context })).await
    }

    /// Resolve a query into sources and queue them on the node.
    ///
    /// # Errors
    /// Fails on HTTP errors or an undecodable node response.
    pub async fn load_source(&self, query: &str) -> Result<Loaded, AudioError> {
        let body = self.node()?.request_source(self.guild_id(), query).await?;
        Loaded::from_body(body)
    }

    /// Skip the current source, or several at once.
    pub async fn skip(&self, offset: u64) -> Result<(), AudioError> {
        self.send(OP_SKIP, json!({ "offset": offset })).await
    }

    /// Seek within the current source, in seconds.
    pub async fn seek(&self, position: f64) -> Result<(), AudioError> {
        self.send(OP_SEEK, json!({ "offset": position })).await
    }

    pub async fn pause(&self) -> Result<(), AudioError> {
        self.send(OP_PAUSE, Value::Null).await
    }

    pub async fn resume(&self) -> Result<(), AudioError> {
        self.send(OP_RESUME, Value::Null).await
    }

    /// Set playback volume, where `1.0` is unity gain.
    pub async fn set_volume(&self, volume: f32) -> Result<(), AudioError> {
        self.send(OP_SET_VOLUME, json!({ "volume": volume })).await
    }

    /// Tell the node to tear this session down. The node answers with a
    /// `VC_DESTROYED` event, which is where local state gets cleaned up.
    ///
    /// # Errors
    /// Transport failures. Callers running best-effort cleanup swallow them.
    pub async fn destroy(&self) -> Result<(), AudioError> {
        self.send(OP_VC_DESTROY, Value::Null).await
    }

    async fn send(&self, op: &str, data: Value) -> Result<(), AudioError> {
        let mut body = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_owned(), other);
                map
            }
        };
        body.insert("guild_id".to_owned(), json!(self.guild_id().get()));
        self.node()?
            .send(Frame::new(op, Value::Object(body)))
            .await?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("guild_id", &self.guild_id())
            .field("channel_id", &self.channel_id())
            .field(
                "node",
                &self.inner.node.upgrade().map(|node| node.id()),
            )
            .finish()
    }
}

impl Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session for guild {}", self.guild_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_loaded_from_single() {
        let loaded = Loaded::from_body(json!({
            "source": {"title": "one", "webpage_url": "https://w", "duration": 3.5}
        }))
        .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.first().unwrap().title, "one");
        assert_eq!(loaded.first().unwrap().duration, Some(3.5));
    }

    #[test]
    fn test_loaded_from_playlist() {
        let loaded = Loaded::from_body(json!({
            "sources": [
                {"title": "one", "webpage_url": "https://1"},
                {"title": "two", "webpage_url": "https://2", "is_live": true}
            ]
        }))
        .unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(!loaded.is_empty());
        assert_eq!(loaded.first().unwrap().webpage_url, "https://1");
    }

    #[test]
    fn test_loaded_rejects_other_shapes() {
        assert!(Loaded::from_body(json!({"ok": true})).is_err());
    }

    #[test]
    fn test_source_keeps_extra_fields() {
        let source: AudioSource = serde_json::from_value(json!({
            "title": "t",
            "webpage_url": "u",
            "chapters": [{"start_time": 0.0}]
        }))
        .unwrap();
        assert!(source.extra.contains_key("chapters"));
    }
}
