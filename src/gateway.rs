//! Inbound gateway payload model and the voice-state seam.
//!
//! Joining or leaving a voice channel is a chat-platform capability owned by
//! whatever Discord library the embedding bot runs on. The client only needs
//! the one call, so it is a trait the bot implements and injects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::guild_id_from_payload;
use crate::{AudioError, ChannelId, GuildId};

/// Gateway payload kind announcing a member's voice state changed.
pub const VOICE_STATE_UPDATE: &str = "VOICE_STATE_UPDATE";
/// Gateway payload kind carrying a guild's voice server endpoint.
pub const VOICE_SERVER_UPDATE: &str = "VOICE_SERVER_UPDATE";

/// A raw payload off the chat platform's real-time connection: a kind tag
/// plus an opaque body. The client only inspects the tag and the body's
/// guild id; everything else is forwarded untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayPayload {
    #[serde(rename = "t")]
    pub kind: String,
    #[serde(rename = "d", default)]
    pub data: Value,
}

impl GatewayPayload {
    #[must_use]
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Whether this payload belongs to a single guild's voice handshake.
    #[must_use]
    pub fn is_voice_update(&self) -> bool {
        self.kind == VOICE_STATE_UPDATE || self.kind == VOICE_SERVER_UPDATE
    }

    /// The guild the payload is scoped to, when its body names one.
    #[must_use]
    pub fn guild_id(&self) -> Option<GuildId> {
        guild_id_from_payload(&self.data)
    }
}

/// The bot's own voice-state control, implemented by the embedding bot.
///
/// `channel = None` means "leave". Implementations should make the leave
/// direction idempotent; the client issues it on teardown paths that may
/// race each other.
#[async_trait]
pub trait VoiceGateway: Send + Sync {
    /// Ask the chat platform to move the bot into (or out of) a voice
    /// channel for the guild.
    ///
    /// # Errors
    /// Surfaces whatever the platform library reports; the client does not
    /// retry.
    async fn update_voice_state(
        &self,
        guild: GuildId,
        channel: Option<ChannelId>,
    ) -> Result<(), AudioError>;
}
