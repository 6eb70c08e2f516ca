use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::connection::TrafficSnapshot;

/// Server-assigned member identifier, unique within a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl MemberId {
    pub fn label(&self) -> String {
        format!("Guest {}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages sent from client to server (must match server protocol)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    Join {
        room_id: String,
    },
    Create {
        title_id: u64,
        episode: u32,
    },
    SetEpisode {
        episode: u32,
    },
    Play {
        time: f64,
        playback_time: f64,
    },
    Pause,
    Seek {
        time: f64,
        playback_time: f64,
    },
    PlaybackTimeRequest,
    PlaybackTimeRequestAnswer {
        time: f64,
        playback_time: f64,
        playing: bool,
        user_id: MemberId,
    },
    PauseRequest,
    RewindBackRequest,
    LeaveRoom,
    ServerTimeRequest {
        time: f64,
    },
}

/// Events pushed from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Init {
        room_id: String,
        members: Vec<MemberId>,
        me: MemberId,
        /// Current host, asserted by the server
        host: MemberId,
        #[serde(default)]
        title_id: Option<u64>,
        #[serde(default, deserialize_with = "optional_episode_number")]
        episode: Option<u32>,
    },
    Join {
        user_id: MemberId,
    },
    LeaveRoom {
        user_id: MemberId,
    },
    HosterPromotion,
    Play {
        time: f64,
        playback_time: f64,
    },
    Pause,
    Seek {
        time: f64,
        playback_time: f64,
    },
    SetEpisode {
        #[serde(deserialize_with = "episode_number")]
        episode: u32,
    },
    PlaybackTimeRequest {
        user_id: MemberId,
    },
    PlaybackTimeRequestAnswer {
        time: f64,
        playback_time: f64,
        playing: bool,
        #[serde(default)]
        user_id: Option<MemberId>,
    },
    PauseRequest {
        sender: MemberId,
    },
    RewindBackRequest {
        sender: MemberId,
    },
    ServerTimeRequestAnswer {
        client_time: f64,
        server_time: f64,
    },
    Error {
        code: i64,
        #[serde(default)]
        message: String,
    },
    /// Any event type this client does not know about
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Init { .. } => "init",
            ServerEvent::Join { .. } => "join",
            ServerEvent::LeaveRoom { .. } => "leave_room",
            ServerEvent::HosterPromotion => "hoster_promotion",
            ServerEvent::Play { .. } => "play",
            ServerEvent::Pause => "pause",
            ServerEvent::Seek { .. } => "seek",
            ServerEvent::SetEpisode { .. } => "set_episode",
            ServerEvent::PlaybackTimeRequest { .. } => "playback_time_request",
            ServerEvent::PlaybackTimeRequestAnswer { .. } => "playback_time_request_answer",
            ServerEvent::PauseRequest { .. } => "pause_request",
            ServerEvent::RewindBackRequest { .. } => "rewind_back_request",
            ServerEvent::ServerTimeRequestAnswer { .. } => "server_time_request_answer",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed server event: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
}

pub fn decode_event(text: &str) -> Result<ServerEvent, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::Decode)
}

pub fn encode_command(command: &ClientCommand) -> Result<String, ProtocolError> {
    serde_json::to_string(command).map_err(ProtocolError::Encode)
}

/// Anything outgoing commands can be handed to.
pub trait CommandSink {
    fn send_command(&mut self, command: ClientCommand) -> anyhow::Result<()>;

    /// Traffic counters when the sink is a live socket
    fn traffic(&self) -> Option<TrafficSnapshot> {
        None
    }
}

impl CommandSink for Vec<ClientCommand> {
    fn send_command(&mut self, command: ClientCommand) -> anyhow::Result<()> {
        self.push(command);
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EpisodeRepr {
    Number(u32),
    Text(String),
}

impl EpisodeRepr {
    fn into_number<E: serde::de::Error>(self) -> Result<u32, E> {
        match self {
            EpisodeRepr::Number(n) => Ok(n),
            EpisodeRepr::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid episode number {text:?}"))),
        }
    }
}

// Episodes arrive as numbers or as numeric strings depending on the sender.
pub(crate) fn episode_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    EpisodeRepr::deserialize(deserializer)?.into_number()
}

fn optional_episode_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u32>, D::Error> {
    Option::<EpisodeRepr>::deserialize(deserializer)?
        .map(EpisodeRepr::into_number)
        .transpose()
}
