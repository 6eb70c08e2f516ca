//! Terminal front end: command parsing and the text shown for session effects.

use crate::catalog::Resolution;
use crate::protocol::MemberId;
use crate::session::{Effect, Navigation, RequestCard, Role};
use crate::utils::parse_time;

#[derive(Debug, Clone, PartialEq)]
pub enum HomeCommand {
    Search(String),
    Create { title_id: u64, episode: u32 },
    /// Share link or bare room code
    Join(String),
    History,
    Forget(u64),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomCommand {
    Play,
    Pause,
    Seek(f64),
    Forward(f64),
    Back(f64),
    Episode(u32),
    Quality(Resolution),
    Sync,
    AskPause,
    AskRewind,
    Mute(MemberId),
    MuteNew(bool),
    Volume(f64),
    Stall,
    Resume,
    Members,
    Status,
    Share,
    Help,
    Leave,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("type a command, or `help`")]
    Empty,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("`{command}` needs {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },
    #[error("`{value}` is not a valid {what}")]
    InvalidArgument { what: &'static str, value: String },
}

fn required<'a>(
    arg: Option<&'a str>,
    command: &'static str,
    what: &'static str,
) -> Result<&'a str, CommandError> {
    arg.ok_or(CommandError::MissingArgument { command, what })
}

fn invalid(what: &'static str, value: &str) -> CommandError {
    CommandError::InvalidArgument {
        what,
        value: value.to_string(),
    }
}

fn seconds(arg: Option<&str>, command: &'static str) -> Result<f64, CommandError> {
    let raw = required(arg, command, "a time like 90 or 1:30")?;
    parse_time(raw).ok_or_else(|| invalid("time", raw))
}

/// Anything that is not a home command is a search query.
pub fn parse_home_command(line: &str) -> Result<HomeCommand, CommandError> {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err(CommandError::Empty);
    };

    match head {
        "create" => {
            let raw = required(words.next(), "create", "a title id")?;
            let title_id = raw.parse().map_err(|_| invalid("title id", raw))?;
            let episode = match words.next() {
                Some(raw) => raw.parse().map_err(|_| invalid("episode", raw))?,
                None => 1,
            };
            Ok(HomeCommand::Create { title_id, episode })
        }
        "join" => Ok(HomeCommand::Join(
            required(words.next(), "join", "a link or room code")?.to_string(),
        )),
        "history" => Ok(HomeCommand::History),
        "forget" => {
            let raw = required(words.next(), "forget", "a title id")?;
            Ok(HomeCommand::Forget(
                raw.parse().map_err(|_| invalid("title id", raw))?,
            ))
        }
        "help" | "?" => Ok(HomeCommand::Help),
        "quit" | "exit" => Ok(HomeCommand::Quit),
        _ => Ok(HomeCommand::Search(line.to_string())),
    }
}

pub fn parse_room_command(line: &str) -> Result<RoomCommand, CommandError> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err(CommandError::Empty);
    };
    let arg = words.next();

    let command = match head {
        "play" => RoomCommand::Play,
        "pause" => RoomCommand::Pause,
        "seek" => RoomCommand::Seek(seconds(arg, "seek")?),
        "fwd" => RoomCommand::Forward(arg.map_or(Ok(10.0), |_| seconds(arg, "fwd"))?),
        "back" => RoomCommand::Back(arg.map_or(Ok(10.0), |_| seconds(arg, "back"))?),
        "episode" | "ep" => {
            let raw = required(arg, "episode", "an episode number")?;
            RoomCommand::Episode(raw.parse().map_err(|_| invalid("episode", raw))?)
        }
        "quality" => {
            let raw = required(arg, "quality", "sd, hd or fhd")?;
            RoomCommand::Quality(raw.parse().map_err(|_| invalid("quality", raw))?)
        }
        "sync" => RoomCommand::Sync,
        "ask-pause" => RoomCommand::AskPause,
        "ask-rewind" => RoomCommand::AskRewind,
        "mute" => {
            let raw = required(arg, "mute", "a member number")?;
            RoomCommand::Mute(MemberId(
                raw.parse().map_err(|_| invalid("member number", raw))?,
            ))
        }
        "mute-new" => match required(arg, "mute-new", "on or off")? {
            "on" => RoomCommand::MuteNew(true),
            "off" => RoomCommand::MuteNew(false),
            other => return Err(invalid("switch", other)),
        },
        "volume" | "vol" => {
            let raw = required(arg, "volume", "a level between 0 and 1")?;
            let level: f64 = raw.parse().map_err(|_| invalid("volume", raw))?;
            if !(0.0..=1.0).contains(&level) {
                return Err(invalid("volume", raw));
            }
            RoomCommand::Volume(level)
        }
        "stall" => RoomCommand::Stall,
        "resume" => RoomCommand::Resume,
        "members" | "who" => RoomCommand::Members,
        "status" => RoomCommand::Status,
        "share" | "link" => RoomCommand::Share,
        "help" | "?" => RoomCommand::Help,
        "leave" | "quit" | "exit" => RoomCommand::Leave,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(command)
}

pub const HOME_HELP: &str = "\
  <text>                  search titles
  create <title> [ep]     open a new room
  join <link|code>        join a room
  history                 recently watched
  forget <title>          drop a title from history
  quit";

pub fn room_help(role: Option<Role>) -> &'static str {
    match role {
        Some(Role::Host) => {
            "\
  play | pause | seek <t> | fwd [t] | back [t]
  episode <n> | quality <sd|hd|fhd> | volume <0..1>
  mute <n> | mute-new <on|off> | share
  stall | resume | members | status | leave"
        }
        _ => {
            "\
  sync | ask-pause | ask-rewind
  quality <sd|hd|fhd> | volume <0..1>
  stall | resume | members | status | leave"
        }
    }
}

fn request_line(card: &RequestCard) -> String {
    format!("! {}", card.text())
}

/// Line to show for an effect, if it is worth showing.
pub fn describe_effect(effect: &Effect) -> Option<String> {
    let line = match effect {
        Effect::Joined { room_id, me, role } => {
            let role = match role {
                Role::Host => "host",
                Role::Participant => "participant",
            };
            format!("Joined room {room_id} as {} ({role})", me.label())
        }
        Effect::ShareUrl(url) => format!("Invite link: {url}"),
        Effect::MemberJoined(id) => format!("{} joined", id.label()),
        Effect::MemberLeft(id) => format!("{} left", id.label()),
        Effect::RequestShown(card) => request_line(card),
        Effect::EpisodeLoaded {
            episode,
            episodes_count,
            resolution,
            ..
        } => format!("Episode {episode}/{episodes_count} at {resolution}"),
        Effect::Navigate(Navigation::Home) => "Room does not exist".to_string(),
        Effect::Navigate(Navigation::Title { title_id, episode }) => {
            format!("Room does not exist; back to title {title_id}, episode {episode}")
        }
        Effect::ControlsChanged(_)
        | Effect::RequestDismissed(_)
        | Effect::TitleRequired(_)
        | Effect::ClockCorrected(_) => return None,
    };
    Some(line)
}
