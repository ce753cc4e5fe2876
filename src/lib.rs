//! Remote audio node orchestration for the Chorok Discord bot.
//!
//! Playback (decoding, mixing, streaming) happens in external node
//! processes; this crate is the coordination layer in front of them. It
//! tracks the node pool, routes voice-gateway traffic to the node that owns
//! each guild, drives the connect/disconnect handshake, and re-dispatches
//! node events to bot-side subscribers.

pub mod config;
pub use config::*;
pub mod error;
pub use error::*;
pub mod events;
pub use events::*;
pub mod gateway;
pub use gateway::*;
pub mod id;
pub use id::*;
pub mod logging;
pub mod node;
pub use node::*;
pub mod session;
pub use session::*;
pub mod transport;
pub use transport::*;

#[cfg(test)]
pub mod test;

//------------------------------------
// External library imports
//------------------------------------
use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
//------------------------------------
// Standard library imports
//------------------------------------
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

//------------------------------------
// Constants
//------------------------------------
/// How long `connect` waits for the node to confirm a new session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_NODE_HOST: &str = "127.0.0.1";
pub const DEFAULT_NODE_PORT: u16 = 8000;
pub const DEFAULT_NODE_PASSWORD: &str = "hellodiscodo";
/// Executable a local node launch runs.
pub const LOCAL_NODE_PROGRAM: &str = "discodo";
pub const LOCAL_NODE_READY_ATTEMPTS: u32 = 40;
pub const LOCAL_NODE_READY_POLL: Duration = Duration::from_millis(250);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(build_configured_http_client);

/// The shared HTTP client used for node REST calls.
pub fn http_client() -> &'static reqwest::Client {
    &HTTP_CLIENT
}

/// Build a configured reqwest client for talking to node REST surfaces.
///
/// # Panics
/// Panics if the reqwest client cannot be built.
#[must_use]
pub fn build_configured_http_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .build()
        .unwrap_or_else(|_| panic!("building the node HTTP client failed"))
}

/// Client for a pool of remote audio nodes.
///
/// This is the one owned context object everything else hangs off: the node
/// registry, the in-flight connect reservations, the gateway payload router
/// and the event fan-out. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AudioClient {
    gateway: Arc<dyn VoiceGateway>,
    user_id: u64,
    /// Bot-side event surface: `on`/`off`/`wait_for`.
    pub dispatcher: EventDispatcher,
    registry: NodeRegistry,
    /// Guild -> node picked for an in-flight connect. A hint for routing the
    /// handshake traffic, never authoritative state.
    reservations: Arc<DashMap<GuildId, Arc<Node>>>,
}

impl fmt::Debug for AudioClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioClient")
            .field("user_id", &self.user_id)
            .field("nodes", &self.registry.len())
            .field("sessions", &self.session_count())
            .field("reservations", &self.reservations.len())
            .finish()
    }
}

impl AudioClient {
    /// Create a client around the bot's voice-state capability.
    ///
    /// `user_id` is the bot's application id, used when identifying against
    /// nodes.
    #[must_use]
    pub fn new(gateway: Arc<dyn VoiceGateway>, user_id: u64) -> Self {
        Self {
            gateway,
            user_id,
            dispatcher: EventDispatcher::new(),
            registry: NodeRegistry::new(),
            reservations: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// The connected node with the fewest sessions, skipping `except`.
    #[must_use]
    pub fn best_node(&self, except: Option<&Node>) -> Option<Arc<Node>> {
        self.registry.best(except)
    }

    //------------------------------------
    // Node registration
    //------------------------------------

    /// Connect a node and add it to the pool.
    ///
    /// A config without an endpoint launches the node service locally
    /// first. A failed connect surfaces as a failed registration; nothing is
    /// retried.
    ///
    /// # Errors
    /// Launch, connect or identify failures.
    pub async fn register_node(&self, config: NodeConfig) -> Result<Arc<Node>, AudioError> {
        let NodeConfig {
            host,
            port,
            password,
            region,
            launch,
        } = config;

        let (host, port, password, child) = match (host, port) {
            (Some(host), Some(port)) => (
                host,
                port,
                password.unwrap_or_else(|| DEFAULT_NODE_PASSWORD.to_owned()),
                None,
            ),
            _ => {
                let local = launch_local_node(&launch).await?;
                (local.host, local.port, local.password, Some(local.child))
            }
        };

        let (transport, events) =
            TcpNodeTransport::connect(&host, port, &password, self.user_id).await?;
        let node = self.attach_node(
            NodeConfig {
                host: Some(host),
                port: Some(port),
                password: Some(password),
                region,
                launch: LaunchOptions::default(),
            },
            Box::new(transport),
            events,
        )?;
        if let Some(child) = child {
            node.adopt_process(child);
        }
        info!(node = %node.as_ref(), "registered audio node");
        Ok(node)
    }

    /// Add a node over an already-established transport.
    ///
    /// This is the seam for custom transports (and for driving a scripted
    /// node in tests): the caller supplies the outbound half and the decoded
    /// event stream.
    ///
    /// # Errors
    /// Fails if the config does not form a valid endpoint.
    pub fn attach_node(
        &self,
        config: NodeConfig,
        transport: Box<dyn NodeTransport>,
        events: mpsc::Receiver<NodeEvent>,
    ) -> Result<Arc<Node>, AudioError> {
        let host = config.host.unwrap_or_else(|| DEFAULT_NODE_HOST.to_owned());
        let port = config.port.unwrap_or(DEFAULT_NODE_PORT);
        let password = config
            .password
            .unwrap_or_else(|| DEFAULT_NODE_PASSWORD.to_owned());
        let node = self
            .registry
            .insert(|id| Node::new(id, host, port, password, config.region, transport))?;
        self.spawn_node_task(Arc::clone(&node), events);
        Ok(node)
    }

    /// Register every node in the configuration.
    ///
    /// An entry marked local (or missing its endpoint) launches one local
    /// node and stops there, the way the bot has always treated its config.
    ///
    /// # Errors
    /// The first failed registration aborts the walk.
    pub async fn register_nodes_from(&self, config: &Config) -> Result<Vec<Arc<Node>>, AudioError> {
        let mut registered = Vec::new();
        for entry in &config.nodes {
            if entry.is_local() {
                registered.push(self.register_node(NodeConfig::local()).await?);
                break;
            }
            registered.push(self.register_node(entry.to_node_config()).await?);
        }
        Ok(registered)
    }

    /// Tear a node down: leave voice in every guild it hosted, then drop the
    /// transport.
    pub async fn close_node(&self, node: &Arc<Node>) {
        for guild in node.guild_ids() {
            if let Err(error) = self.disconnect(guild).await {
                debug!(%guild, %error, "voice leave failed while closing node");
            }
        }
        node.close();
        info!(node = %node.as_ref(), "closed audio node");
    }

    //------------------------------------
    // Session lookup
    //------------------------------------

    /// Every live session across the connected nodes.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.registry
            .connected()
            .iter()
            .flat_map(|node| node.sessions())
            .collect()
    }

    /// Number of live sessions across the connected nodes.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry
            .connected()
            .iter()
            .map(|node| node.session_count())
            .sum()
    }

    /// The guild's live session, if one exists.
    #[must_use]
    pub fn find_session(&self, guild: GuildId) -> Option<Session> {
        self.registry
            .connected()
            .iter()
            .find_map(|node| node.session(guild))
    }

    /// The guild's live session.
    ///
    /// # Errors
    /// [`AudioError::SessionNotFound`] if the guild has none.
    pub fn get_session(&self, guild: GuildId) -> Result<Session, AudioError> {
        self.find_session(guild)
            .ok_or(AudioError::SessionNotFound(guild))
    }

    //------------------------------------
    // Gateway payload routing
    //------------------------------------

    /// Route a raw gateway payload to the node(s) that need it.
    ///
    /// Voice handshake payloads go to exactly one node: the guild's
    /// reservation if a connect is in flight, else the node hosting the
    /// guild's session, else the best available node. Everything else is
    /// broadcast to every connected node. Deliveries run concurrently and
    /// failures are logged, not raised.
    pub async fn dispatch(&self, payload: &GatewayPayload) {
        let targets: Vec<Arc<Node>> = if payload.is_voice_update() {
            let Some(guild) = payload.guild_id() else {
                debug!(kind = %payload.kind, "voice payload without guild id");
                return;
            };
            let target = self
                .reservations
                .get(&guild)
                .map(|reserved| Arc::clone(reserved.value()))
                .or_else(|| self.find_session(guild).and_then(|s| s.node().ok()))
                .or_else(|| self.registry.best(None));
            target.into_iter().collect()
        } else {
            self.registry.connected()
        };

        let mut deliveries = targets
            .iter()
            .filter(|node| node.is_connected())
            .map(|node| async move {
                if let Err(error) = node.forward_gateway(payload).await {
                    warn!(node = %node.as_ref(), %error, "gateway payload delivery failed");
                }
            })
            .collect::<FuturesUnordered<_>>();
        while deliveries.next().await.is_some() {}
    }

    //------------------------------------
    // Connection coordination
    //------------------------------------

    /// Join a guild's voice channel and return the session serving it.
    ///
    /// Picks the least-loaded node unless one is given, reserves it for the
    /// guild so handshake traffic routes there, tears down any session the
    /// guild holds on a *different* node (best effort), asks the gateway to
    /// join, and waits for the node's confirmation.
    ///
    /// # Errors
    /// [`AudioError::NodeUnavailable`] with no node connected and none
    /// given; [`AudioError::Timeout`] if no confirmation arrives within
    /// [`CONNECT_TIMEOUT`]; gateway failures as-is. Callers decide whether
    /// to retry.
    pub async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        node: Option<Arc<Node>>,
    ) -> Result<Session, AudioError> {
        let node = match node {
            Some(node) => node,
            None => self.registry.best(None).ok_or(AudioError::NodeUnavailable)?,
        };
        self.reservations.insert(guild, Arc::clone(&node));

        let existing = self.find_session(guild);
        if let Some(existing) = &existing {
            if !existing.is_on(&node) {
                // Best effort; the replacement proceeds regardless.
                if let Err(error) = existing.destroy().await {
                    debug!(%guild, %error, "stale session teardown failed");
                }
            }
        }
        let reuse = existing.filter(|session| session.is_on(&node));

        let session = match reuse {
            Some(session) => {
                // Same node already serves the guild; this is a channel move.
                if let Err(error) = self.gateway.update_voice_state(guild, Some(channel)).await {
                    self.clear_reservation(guild, &node);
                    return Err(error);
                }
                session
            }
            None => {
                // Subscribe before the join goes out so the confirmation
                // cannot slip between the two.
                let confirmation = self.dispatcher.wait_for(
                    VC_CREATED,
                    move |session, _| session.guild_id() == guild,
                    CONNECT_TIMEOUT,
                );
                if let Err(error) = self.gateway.update_voice_state(guild, Some(channel)).await {
                    self.clear_reservation(guild, &node);
                    return Err(error);
                }
                match confirmation.await {
                    Ok((session, _)) => session,
                    Err(error) => {
                        self.clear_reservation(guild, &node);
                        return Err(error);
                    }
                }
            }
        };

        self.clear_reservation(guild, &node);
        Ok(session)
    }

    /// Leave the guild's voice channel.
    ///
    /// Only the gateway signal is sent; the remote session is torn down via
    /// the node's `VC_DESTROYED` side channel, or explicitly with
    /// [`AudioClient::destroy`].
    ///
    /// # Errors
    /// Gateway failures as-is.
    pub async fn disconnect(&self, guild: GuildId) -> Result<(), AudioError> {
        self.gateway.update_voice_state(guild, None).await
    }

    /// Leave voice and tear the guild's session down on its node.
    ///
    /// # Errors
    /// [`AudioError::SessionNotFound`] without a live session; transport
    /// failures from the teardown. The voice-state clear itself is best
    /// effort.
    pub async fn destroy(&self, guild: GuildId) -> Result<(), AudioError> {
        let session = self.get_session(guild)?;
        if let Err(error) = self.gateway.update_voice_state(guild, None).await {
            debug!(%guild, %error, "voice state clear failed during destroy");
        }
        session.destroy().await
    }

    /// Drop the guild's reservation, but only while it still points at the
    /// node this caller picked. A racing later connect keeps its own
    /// reservation (last writer wins).
    fn clear_reservation(&self, guild: GuildId, node: &Arc<Node>) {
        self.reservations
            .remove_if(&guild, |_, reserved| reserved.id() == node.id());
    }

    #[cfg(test)]
    pub(crate) fn has_reservation(&self, guild: GuildId) -> bool {
        self.reservations.contains_key(&guild)
    }

    //------------------------------------
    // Node event handling
    //------------------------------------

    fn spawn_node_task(&self, node: Arc<Node>, mut events: mpsc::Receiver<NodeEvent>) {
        let client = self.clone();
        tokio::spawn(async move {
            // One event at a time: per-node ordering is the delivery
            // guarantee subscribers get.
            while let Some(event) = events.recv().await {
                client.handle_node_event(&node, event).await;
            }
            warn!(node = %node.as_ref(), "node event stream ended");
            node.mark_disconnected();
        });
    }

    async fn handle_node_event(&self, node: &Arc<Node>, event: NodeEvent) {
        match event {
            NodeEvent::VcCreated { guild_id, data } => {
                let channel_id = data
                    .get("channel_id")
                    .and_then(crate::id::snowflake_from_value)
                    .and_then(ChannelId::new);
                let session = Session::new(guild_id, channel_id, node);
                node.insert_session(session.clone());
                debug!(guild = %guild_id, node = %node.as_ref(), "voice session created");
                self.dispatcher.dispatch(VC_CREATED, session, data).await;
            }
            NodeEvent::VcDestroyed { guild_id, .. } => {
                node.remove_session(guild_id);
                debug!(guild = %guild_id, node = %node.as_ref(), "voice session destroyed");
                // Clear our own voice state to match reality; without this a
                // dead session would keep the bot parked in the channel.
                if let Err(error) = self.gateway.update_voice_state(guild_id, None).await {
                    debug!(guild = %guild_id, %error, "voice leave after session destroy failed");
                }
            }
            NodeEvent::SourceStart { guild_id, data } => {
                self.fan_out(SOURCE_START, guild_id, data).await;
            }
            NodeEvent::SourceStop { guild_id, data } => {
                self.fan_out(SOURCE_STOP, guild_id, data).await;
            }
            NodeEvent::Resumed(state) => {
                info!(node = %node.as_ref(), sessions = state.voice_clients.len(), "node resumed");
                for (guild_raw, voice_client) in state.voice_clients {
                    let Ok(guild) = guild_raw.parse::<GuildId>() else {
                        continue;
                    };
                    let client = self.clone();
                    let node = Arc::clone(node);
                    tokio::spawn(async move {
                        let result = match voice_client.channel {
                            Some(channel) => client
                                .connect(guild, channel, Some(node))
                                .await
                                .map(|_| ()),
                            None => client.disconnect(guild).await,
                        };
                        if let Err(error) = result {
                            warn!(%guild, %error, "resume reconciliation failed");
                        }
                    });
                }
            }
            NodeEvent::Unknown { name, data } => {
                let Some(guild_id) = crate::id::guild_id_from_payload(&data) else {
                    return;
                };
                self.fan_out(&name, guild_id, data).await;
            }
        }
    }

    /// Resolve a guild-scoped event to its live session and re-dispatch it.
    /// Events for guilds without a session are dropped.
    async fn fan_out(&self, name: &str, guild: GuildId, data: serde_json::Value) {
        let Some(session) = self.find_session(guild) else {
            return;
        };
        self.dispatcher.dispatch(name, session, data).await;
    }
}
