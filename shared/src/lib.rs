use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
pub const MAX_CHAT_LEN: usize = 200;
pub const CHAT_HISTORY_LEN: usize = 50;

pub type SessionId = u64;

/// Facing direction of a player sprite.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    Up,
    #[default]
    Down,
    Left,
    Right,
    None,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
            Direction::None => "NONE",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDirectionError(pub String);

impl fmt::Display for ParseDirectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown direction '{}'", self.0)
    }
}

impl std::error::Error for ParseDirectionError {}

impl FromStr for Direction {
    type Err = ParseDirectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            "LEFT" => Ok(Direction::Left),
            "RIGHT" => Ok(Direction::Right),
            "NONE" => Ok(Direction::None),
            _ => Err(ParseDirectionError(s.to_string())),
        }
    }
}

/// A single primitive value inside a party snapshot.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum PartyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for PartyValue {
    fn from(value: bool) -> Self {
        PartyValue::Bool(value)
    }
}

impl From<i64> for PartyValue {
    fn from(value: i64) -> Self {
        PartyValue::Int(value)
    }
}

impl From<f64> for PartyValue {
    fn from(value: f64) -> Self {
        PartyValue::Float(value)
    }
}

impl From<&str> for PartyValue {
    fn from(value: &str) -> Self {
        PartyValue::Text(value.to_string())
    }
}

impl From<String> for PartyValue {
    fn from(value: String) -> Self {
        PartyValue::Text(value)
    }
}

/// Opaque snapshot of a player's party leader (name, hp, level, ...).
///
/// The server stores and returns it untouched; only clients give the keys
/// any meaning.
pub type PartySnapshot = BTreeMap<String, PartyValue>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerView {
    pub id: SessionId,
    pub x: f32,
    pub y: f32,
    pub map: String,
    pub direction: Direction,
    pub party: Option<PartySnapshot>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: SessionId,
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
    },
    Update {
        x: f32,
        y: f32,
        map: String,
        direction: Direction,
        party: Option<PartySnapshot>,
    },
    ListRequest,
    Chat {
        text: String,
    },
    ChatHistoryRequest {
        limit: u32,
    },
    Disconnect,

    Connected {
        session_id: SessionId,
        timeout_secs: u64,
    },
    Rejected {
        reason: String,
    },
    WorldState {
        players: Vec<PlayerView>,
    },
    ChatMessage {
        line: ChatLine,
    },
    ChatHistory {
        lines: Vec<ChatLine>,
    },
}
