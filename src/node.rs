//! Remote audio-rendering nodes and the registry that owns them.
//!
//! A [`Node`] is a plain record of one connected backend: endpoint identity,
//! a liveness flag, and the voice sessions it currently hosts. All mutation
//! goes through the registry or the owning client; nodes are never handed
//! out mutably.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use url::Url;

use crate::{
    http_client, AudioError, Frame, GatewayPayload, GuildId, NodeTransport, Session,
    TransportError, DEFAULT_NODE_HOST, DEFAULT_NODE_PASSWORD, DEFAULT_NODE_PORT,
    LOCAL_NODE_PROGRAM, LOCAL_NODE_READY_ATTEMPTS, LOCAL_NODE_READY_POLL,
};

/// Frame op that wraps a forwarded gateway payload.
const DISCORD_DISPATCH: &str = "DISCORD_DISPATCH";

/// Registry-assigned node identity. Two registrations against the same
/// endpoint are distinct nodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct NodeId(pub(crate) u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Where and how to reach a node.
///
/// Leaving the endpoint empty means "launch the node service locally first"
/// using [`LaunchOptions`].
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub region: Option<String>,
    pub launch: LaunchOptions,
}

impl NodeConfig {
    /// Config for a node reachable at `host:port`.
    #[must_use]
    pub fn endpoint(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Config that launches a local node service on registration.
    #[must_use]
    pub fn local() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Whether registration has to launch a local service first.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host.is_none() || self.port.is_none()
    }
}

/// How to spawn a local node service when no endpoint is configured.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Executable to run.
    pub program: String,
    /// Extra arguments, appended after the endpoint arguments.
    pub args: Vec<String>,
    pub host: String,
    pub port: u16,
    pub password: String,
}

/// Implement [`Default`] for [`LaunchOptions`].
impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            program: LOCAL_NODE_PROGRAM.to_owned(),
            args: Vec::new(),
            host: DEFAULT_NODE_HOST.to_owned(),
            port: DEFAULT_NODE_PORT,
            password: DEFAULT_NODE_PASSWORD.to_owned(),
        }
    }
}

/// A locally launched node service. Killing the process is tied to the
/// child handle's drop.
pub(crate) struct LocalNode {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub child: Child,
}

/// Spawn the node service and wait for its port to accept connections.
///
/// # Errors
/// Fails if the process cannot be spawned or never becomes reachable.
pub(crate) async fn launch_local_node(options: &LaunchOptions) -> Result<LocalNode, AudioError> {
    let mut command = Command::new(&options.program);
    command
        .arg("--host")
        .arg(&options.host)
        .arg("--port")
        .arg(options.port.to_string())
        .arg("--auth")
        .arg(&options.password)
        .args(&options.args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    let child = command.spawn()?;
    tracing::info!(program = %options.program, port = options.port, "launched local node");

    for _ in 0..LOCAL_NODE_READY_ATTEMPTS {
        if tokio::net::TcpStream::connect((options.host.as_str(), options.port))
            .await
            .is_ok()
        {
            return Ok(LocalNode {
                host: options.host.clone(),
                port: options.port,
                password: options.password.clone(),
                child,
            });
        }
        tokio::time::sleep(LOCAL_NODE_READY_POLL).await;
    }

    Err(AudioError::Timeout("local node startup".to_owned()))
}

/// Point-in-time resource report from a node's REST surface.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    /// Megabytes in use by the node process.
    pub used_memory: u64,
    /// Megabytes available on the node host.
    pub total_memory: u64,
    pub threads: u64,
    /// Megabytes received per second.
    pub network_inbound: f64,
    /// Megabytes sent per second.
    pub network_outbound: f64,
}

/// One connected audio-rendering backend.
pub struct Node {
    id: NodeId,
    host: String,
    port: u16,
    password: String,
    region: Option<String>,
    rest_base: Url,
    connected: AtomicBool,
    sessions: DashMap<GuildId, Session>,
    transport: Box<dyn NodeTransport>,
    /// Holds the child process for locally launched nodes so its lifetime
    /// matches the node's.
    local_process: Mutex<Option<Child>>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        host: String,
        port: u16,
        password: String,
        region: Option<String>,
        transport: Box<dyn NodeTransport>,
    ) -> Result<Self, AudioError> {
        let rest_base = Url::parse(&format!("http://{host}:{port}/"))
            .map_err(|e| AudioError::InvalidArgument(e.to_string()))?;
        Ok(Self {
            id,
            host,
            port,
            password,
            region,
            rest_base,
            connected: AtomicBool::new(true),
            sessions: DashMap::new(),
            transport,
            local_process: Mutex::new(None),
        })
    }

    pub(crate) fn adopt_process(&self, child: Child) {
        *self.local_process.lock() = Some(child);
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.transport.is_connected()
    }

    /// Number of voice sessions this node currently hosts.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The live session for a guild on this node, if any.
    #[must_use]
    pub fn session(&self, guild: GuildId) -> Option<Session> {
        self.sessions.get(&guild).map(|s| s.value().clone())
    }

    /// Snapshot of the sessions this node hosts.
    #[must_use]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Guilds with a session on this node.
    #[must_use]
    pub fn guild_ids(&self) -> Vec<GuildId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn insert_session(&self, session: Session) {
        self.sessions.insert(session.guild_id(), session);
    }

    pub(crate) fn remove_session(&self, guild: GuildId) -> Option<Session> {
        self.sessions.remove(&guild).map(|(_, session)| session)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Send a raw frame to the node.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.transport.send(frame).await
    }

    /// Forward a gateway payload over the node transport.
    ///
    /// # Errors
    /// Propagates transport failures; the router decides what to do with
    /// them.
    pub async fn forward_gateway(&self, payload: &GatewayPayload) -> Result<(), TransportError> {
        self.send(Frame::new(
            DISCORD_DISPATCH,
            serde_json::to_value(payload).map_err(|e| TransportError::Malformed(e.to_string()))?,
        ))
        .await
    }

    /// Fetch the node's resource status from its REST surface.
    ///
    /// # Errors
    /// Fails on HTTP errors or an undecodable body.
    pub async fn fetch_status(&self) -> Result<NodeStatus, AudioError> {
        let url = self.rest_url("status")?;
        let status = http_client()
            .get(url)
            .header("Authorization", &self.password)
            .send()
            .await?
            .error_for_status()?
            .json::<NodeStatus>()
            .await?;
        Ok(status)
    }

    /// Ask the node to resolve a query into playable sources for a guild.
    pub(crate) async fn request_source(
        &self,
        guild: GuildId,
        query: &str,
    ) -> Result<serde_json::Value, AudioError> {
        let url = self.rest_url("loadSource")?;
        let body = http_client()
            .post(url)
            .header("Authorization", &self.password)
            .json(&json!({ "guild_id": guild.get(), "query": query }))
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await?;
        Ok(body)
    }

    fn rest_url(&self, path: &str) -> Result<Url, AudioError> {
        self.rest_base
            .join(path)
            .map_err(|e| AudioError::InvalidArgument(e.to_string()))
    }

    /// Drop the transport. The owning client handles the session fallout.
    pub(crate) fn close(&self) {
        self.transport.close();
        self.mark_disconnected();
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("region", &self.region)
            .field("connected", &self.is_connected())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.host, self.port)
    }
}

/// Registration-ordered collection of nodes.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<Vec<Arc<Node>>>>,
    next_id: Arc<AtomicU64>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next node id and append the built node.
    pub(crate) fn insert(
        &self,
        build: impl FnOnce(NodeId) -> Result<Node, AudioError>,
    ) -> Result<Arc<Node>, AudioError> {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new(build(id)?);
        self.nodes.write().push(Arc::clone(&node));
        Ok(node)
    }

    /// Snapshot of every registered node, in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.read().clone()
    }

    /// Snapshot of the currently connected nodes, in registration order.
    #[must_use]
    pub fn connected(&self) -> Vec<Arc<Node>> {
        self.nodes
            .read()
            .iter()
            .filter(|node| node.is_connected())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.read().iter().find(|n| n.id() == id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// The connected node with the fewest sessions, or `None` when nothing
    /// is connected.
    ///
    /// Ties go to the earliest registration (the sort is stable); `except`
    /// removes one node from consideration.
    #[must_use]
    pub fn best(&self, except: Option<&Node>) -> Option<Arc<Node>> {
        let mut candidates = self.connected();
        candidates.sort_by_key(|node| node.session_count());
        if let Some(except) = except {
            candidates.retain(|node| node.id() != except.id());
        }
        candidates.into_iter().next()
    }
}
