//! Snowflake id newtypes.
//!
//! The client is framework-agnostic, so it carries its own guild/channel id
//! types instead of borrowing them from any particular Discord library.
//! Gateway payloads deliver ids as either JSON strings or integers; both
//! forms parse here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use std::num::NonZeroU64;
use std::str::FromStr;

use crate::AudioError;

/// Id of a Discord guild.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuildId(pub NonZeroU64);

/// Id of a Discord voice channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub NonZeroU64);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            /// Create a new id, returning `None` for the invalid zero value.
            #[must_use]
            pub fn new(id: u64) -> Option<Self> {
                NonZeroU64::new(id).map(Self)
            }

            /// The raw snowflake value.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl From<NonZeroU64> for $name {
            fn from(id: NonZeroU64) -> Self {
                Self(id)
            }
        }

        impl TryFrom<u64> for $name {
            type Error = AudioError;

            fn try_from(id: u64) -> Result<Self, Self::Error> {
                Self::new(id).ok_or_else(|| AudioError::InvalidArgument(id.to_string()))
            }
        }

        impl FromStr for $name {
            type Err = AudioError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>()
                    .ok()
                    .and_then(Self::new)
                    .ok_or_else(|| AudioError::InvalidArgument(s.to_string()))
            }
        }
    };
}

impl_id!(GuildId);
impl_id!(ChannelId);

/// Pull a snowflake out of a JSON value that may be a string or an integer.
#[must_use]
pub(crate) fn snowflake_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Extract and parse a guild id field from an event body.
#[must_use]
pub(crate) fn guild_id_from_payload(data: &Value) -> Option<GuildId> {
    data.get("guild_id")
        .and_then(snowflake_from_value)
        .and_then(GuildId::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_forms() {
        assert_eq!("123".parse::<GuildId>().unwrap().get(), 123);
        assert!("0".parse::<GuildId>().is_err());
        assert!("abc".parse::<ChannelId>().is_err());
        assert!(GuildId::try_from(0).is_err());
    }

    #[test]
    fn test_guild_id_from_payload() {
        assert_eq!(
            guild_id_from_payload(&json!({"guild_id": "42"})),
            GuildId::new(42)
        );
        assert_eq!(
            guild_id_from_payload(&json!({"guild_id": 42})),
            GuildId::new(42)
        );
        assert_eq!(guild_id_from_payload(&json!({"guild_id": null})), None);
        assert_eq!(guild_id_from_payload(&json!({})), None);
    }
}
