//! Room session: membership, roles and the mapping from server events onto
//! the playback mirror.

use anyhow::Result;
use std::sync::Arc;

use crate::catalog::{Resolution, Title};
use crate::clock::{Clock, ClockSync};
use crate::constants::{REQUEST_CARD_LIFETIME, REQUEST_COOLDOWN, ROOM_NOT_FOUND_CODE};
use crate::invite::build_watch_url;
use crate::mirror::{
    normalize_episode, EpisodeLoaded, MirrorError, MirrorState, PlaybackMirror, PlaybackState,
};
use crate::player::{MediaEngine, TransportEvent};
use crate::protocol::{ClientCommand, CommandSink, MemberId, ServerEvent};
use crate::throttle::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: MemberId,
    pub muted: bool,
    pub is_me: bool,
}

/// How the room is entered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEntry {
    Join { room_id: String },
    Create { title_id: u64, episode: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Pause,
    Rewind,
}

/// Advisory request shown to the host for a short while
#[derive(Debug, Clone, PartialEq)]
pub struct RequestCard {
    pub sender: MemberId,
    pub kind: RequestKind,
    pub expires_at: f64,
}

impl RequestCard {
    pub fn text(&self) -> String {
        match self.kind {
            RequestKind::Pause => format!("{} asks to pause", self.sender.label()),
            RequestKind::Rewind => format!("{} asks to rewind", self.sender.label()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Home,
    Title { title_id: u64, episode: u32 },
}

/// Which controls the current role gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub episode_list: bool,
    pub room_menu: bool,
    pub synchronize: bool,
    pub pause_request: bool,
    pub rewind_request: bool,
}

impl Controls {
    pub fn for_role(role: Role) -> Self {
        let host = role == Role::Host;
        Self {
            episode_list: host,
            room_menu: host,
            synchronize: !host,
            pause_request: !host,
            rewind_request: !host,
        }
    }
}

/// Things the front end should react to
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Joined {
        room_id: String,
        me: MemberId,
        role: Role,
    },
    ControlsChanged(Controls),
    ShareUrl(String),
    MemberJoined(MemberId),
    MemberLeft(MemberId),
    RequestShown(RequestCard),
    RequestDismissed(RequestCard),
    EpisodeLoaded {
        title_id: u64,
        episode: u32,
        episodes_count: u32,
        resolution: Resolution,
    },
    /// The room plays a title this client has not fetched yet
    TitleRequired(u64),
    ClockCorrected(f64),
    Navigate(Navigation),
}

/// Everything the session knows about the room and local playback.
pub struct SessionState {
    pub room_id: Option<String>,
    pub members: Vec<Member>,
    pub me: Option<MemberId>,
    pub host: Option<MemberId>,
    pub role: Option<Role>,
    pub title_id: Option<u64>,
    pub title: Option<Title>,
    pub playback: PlaybackState,
    pub mute_new_members: bool,
    pub clock_sync: ClockSync,
    clock: Arc<dyn Clock>,
}

impl SessionState {
    pub fn new(
        clock: Arc<dyn Clock>,
        title: Option<Title>,
        episode: u32,
        resolution: Resolution,
    ) -> Self {
        Self {
            room_id: None,
            members: Vec::new(),
            me: None,
            host: None,
            role: None,
            title_id: title.as_ref().map(|t| t.id),
            title,
            playback: PlaybackState::new(episode, resolution),
            mute_new_members: false,
            clock_sync: ClockSync::default(),
            clock,
        }
    }

    pub fn local_now(&self) -> f64 {
        self.clock.now()
    }

    /// Room time: the local clock with the server correction applied.
    pub fn now(&self) -> f64 {
        self.clock_sync.now(self.local_now())
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn is_muted(&self, id: MemberId) -> bool {
        self.member(id).map(|m| m.muted).unwrap_or(false)
    }

    /// Copy the engine's position and paused flag into the playback view.
    pub fn observe<E: MediaEngine + ?Sized>(&mut self, engine: &E) {
        self.playback.position = engine.position();
        self.playback.paused = engine.is_paused();
    }
}

pub struct RoomSession {
    entry: RoomEntry,
    state: SessionState,
    mirror: PlaybackMirror,
    request_limiter: RateLimiter,
    cards: Vec<RequestCard>,
}

impl RoomSession {
    pub fn new(entry: RoomEntry, state: SessionState) -> Self {
        Self {
            entry,
            state,
            mirror: PlaybackMirror::new(),
            request_limiter: RateLimiter::new(REQUEST_COOLDOWN),
            cards: Vec::new(),
        }
    }

    pub fn entry(&self) -> &RoomEntry {
        &self.entry
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn mirror_state(&self) -> MirrorState {
        self.mirror.state()
    }

    pub fn role(&self) -> Option<Role> {
        self.state.role
    }

    pub fn cards(&self) -> &[RequestCard] {
        &self.cards
    }

    /// Load the starting episode if the title is known, then ask the server
    /// to join or create the room and start calibrating the clock.
    pub fn open<E, S>(&mut self, engine: &mut E, sink: &mut S) -> Result<Vec<Effect>>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        let mut effects = Vec::new();
        if self.state.title.is_some() {
            let loaded =
                self.mirror
                    .init_episode(self.state.playback.episode, &mut self.state, engine)?;
            effects.extend(self.loaded_effect(&loaded));
        }

        let command = match &self.entry {
            RoomEntry::Join { room_id } => {
                tracing::info!("Joining room {}", room_id);
                ClientCommand::Join {
                    room_id: room_id.clone(),
                }
            }
            RoomEntry::Create { title_id, episode } => {
                tracing::info!("Creating room for title {} episode {}", title_id, episode);
                ClientCommand::Create {
                    title_id: *title_id,
                    episode: normalize_episode(*episode),
                }
            }
        };
        sink.send_command(command)?;
        self.mirror.begin();

        if let Some(probe) = self
            .state
            .clock_sync
            .request_reference_time(self.state.local_now())
        {
            sink.send_command(probe)?;
        }
        Ok(effects)
    }

    pub fn handle_event<E, S>(
        &mut self,
        event: ServerEvent,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<Vec<Effect>>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        if self.mirror.state() == MirrorState::Left {
            tracing::debug!("Dropping {} after leaving the room", event.kind());
            return Ok(Vec::new());
        }
        tracing::trace!("Server event: {:?}", event);

        let mut effects = Vec::new();
        match event {
            ServerEvent::Init {
                room_id,
                members,
                me,
                host,
                title_id,
                episode,
            } => {
                effects = self.on_init(room_id, members, me, host, title_id, episode, engine, sink)?;
            }
            ServerEvent::Join { user_id } => {
                if Some(user_id) != self.state.me && self.state.member(user_id).is_none() {
                    self.state.members.push(Member {
                        id: user_id,
                        muted: self.state.mute_new_members,
                        is_me: false,
                    });
                    tracing::info!("{} joined", user_id.label());
                    effects.push(Effect::MemberJoined(user_id));
                }
            }
            ServerEvent::LeaveRoom { user_id } => {
                let before = self.state.members.len();
                self.state.members.retain(|m| m.id != user_id);
                self.cards.retain(|c| c.sender != user_id);
                if self.state.members.len() != before {
                    tracing::info!("{} left", user_id.label());
                    effects.push(Effect::MemberLeft(user_id));
                }
            }
            ServerEvent::HosterPromotion => {
                if !self.state.is_host() {
                    tracing::info!("Promoted to host");
                    self.state.role = Some(Role::Host);
                    self.state.host = self.state.me;
                    self.mirror.assume_role(Role::Host);
                    effects.push(Effect::ControlsChanged(Controls::for_role(Role::Host)));
                    effects.push(Effect::ShareUrl(self.share_url()));
                }
            }
            ServerEvent::Play {
                time,
                playback_time,
            } => {
                self.mirror
                    .on_remote_play(time, playback_time, &mut self.state, engine)?;
            }
            ServerEvent::Pause => {
                self.mirror.on_remote_pause(&mut self.state, engine)?;
            }
            ServerEvent::Seek {
                time,
                playback_time,
            } => {
                self.mirror
                    .on_remote_seek(time, playback_time, &mut self.state, engine)?;
            }
            ServerEvent::SetEpisode { episode } => {
                let loaded = self
                    .mirror
                    .on_remote_set_episode(episode, &mut self.state, engine)?;
                effects.extend(self.loaded_effect(&loaded));
            }
            ServerEvent::PlaybackTimeRequest { user_id } => {
                self.mirror
                    .answer_playback_time_request(user_id, &self.state, engine, sink)?;
            }
            ServerEvent::PlaybackTimeRequestAnswer {
                time,
                playback_time,
                playing,
                ..
            } => {
                self.mirror.on_playback_time_answer(
                    time,
                    playback_time,
                    playing,
                    &mut self.state,
                    engine,
                )?;
            }
            ServerEvent::PauseRequest { sender } => {
                effects.extend(self.on_request(sender, RequestKind::Pause));
            }
            ServerEvent::RewindBackRequest { sender } => {
                effects.extend(self.on_request(sender, RequestKind::Rewind));
            }
            ServerEvent::ServerTimeRequestAnswer {
                client_time,
                server_time,
            } => {
                let local_now = self.state.local_now();
                match self
                    .state
                    .clock_sync
                    .complete_probe(client_time, server_time, local_now)
                {
                    Ok(correction) => {
                        tracing::debug!("Clock correction {:.3}s", correction);
                        effects.push(Effect::ClockCorrected(correction));
                    }
                    Err(e) => tracing::warn!("Ignoring time reply: {}", e),
                }
            }
            ServerEvent::Error { code, message } => {
                tracing::error!("Room server error {}: {}", code, message);
                if code == ROOM_NOT_FOUND_CODE {
                    self.mirror.leave();
                    self.cards.clear();
                    let target = match self.state.title_id {
                        Some(title_id) => Navigation::Title {
                            title_id,
                            episode: self.state.playback.episode,
                        },
                        None => Navigation::Home,
                    };
                    effects.push(Effect::Navigate(target));
                }
            }
            ServerEvent::Unknown => {
                tracing::warn!("Ignoring unknown server event");
            }
        }
        self.state.observe(engine);
        Ok(effects)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_init<E, S>(
        &mut self,
        room_id: String,
        members: Vec<MemberId>,
        me: MemberId,
        host: MemberId,
        title_id: Option<u64>,
        episode: Option<u32>,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<Vec<Effect>>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        let role = if host == me {
            Role::Host
        } else {
            Role::Participant
        };
        tracing::info!(
            "Joined room {} as {} ({:?}, {} members)",
            room_id,
            me.label(),
            role,
            members.len()
        );

        let mute_others = self.state.mute_new_members;
        self.state.members = members
            .into_iter()
            .map(|id| Member {
                id,
                muted: mute_others && id != me,
                is_me: id == me,
            })
            .collect();
        if self.state.member(me).is_none() {
            self.state.members.push(Member {
                id: me,
                muted: false,
                is_me: true,
            });
        }
        self.state.room_id = Some(room_id.clone());
        self.state.me = Some(me);
        self.state.host = Some(host);
        self.state.role = Some(role);
        self.mirror.assume_role(role);

        match (self.state.title_id, title_id) {
            (Some(ours), Some(theirs)) if ours != theirs => {
                tracing::warn!("Room plays title {}, we opened {}", theirs, ours);
                self.state.title_id = Some(theirs);
                self.state.title = None;
            }
            (None, Some(theirs)) => self.state.title_id = Some(theirs),
            _ => {}
        }

        let mut effects = vec![
            Effect::Joined { room_id, me, role },
            Effect::ControlsChanged(Controls::for_role(role)),
        ];

        match role {
            Role::Host => effects.push(Effect::ShareUrl(self.share_url())),
            Role::Participant => {
                let target = episode
                    .map(normalize_episode)
                    .unwrap_or(self.state.playback.episode);
                if self.state.title.is_some() {
                    if engine.source().is_none() || target != self.state.playback.episode {
                        let loaded = self.mirror.init_episode(target, &mut self.state, engine)?;
                        effects.extend(self.loaded_effect(&loaded));
                    }
                    self.mirror.synchronize(sink)?;
                } else {
                    self.state.playback.episode = target;
                    if let Some(title_id) = self.state.title_id {
                        effects.push(Effect::TitleRequired(title_id));
                    }
                }
            }
        }
        Ok(effects)
    }

    /// Supply the title after it has been fetched, load the current episode
    /// and, for participants, ask the host where playback is.
    pub fn provide_title<E, S>(
        &mut self,
        title: Title,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<Vec<Effect>>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        self.state.title_id = Some(title.id);
        self.state.title = Some(title);
        let loaded =
            self.mirror
                .init_episode(self.state.playback.episode, &mut self.state, engine)?;
        let effects = self.loaded_effect(&loaded).into_iter().collect();
        if self.mirror.state() == MirrorState::Following {
            self.mirror.synchronize(sink)?;
        }
        Ok(effects)
    }

    fn loaded_effect(&self, loaded: &EpisodeLoaded) -> Option<Effect> {
        let title = self.state.title.as_ref()?;
        Some(Effect::EpisodeLoaded {
            title_id: title.id,
            episode: loaded.episode,
            episodes_count: title.episode_count(),
            resolution: loaded.resolution,
        })
    }

    fn on_request(&mut self, sender: MemberId, kind: RequestKind) -> Option<Effect> {
        if !self.state.is_host() {
            tracing::debug!("{:?} request from {} while not host", kind, sender);
            return None;
        }
        if self.state.is_muted(sender) {
            tracing::debug!("Dropping {:?} request from muted {}", kind, sender);
            return None;
        }
        let card = RequestCard {
            sender,
            kind,
            expires_at: self.state.local_now() + REQUEST_CARD_LIFETIME.as_secs_f64(),
        };
        self.cards.push(card.clone());
        Some(Effect::RequestShown(card))
    }

    /// Feed a transport event raised by the local engine.
    pub fn handle_local_event<E, S>(
        &mut self,
        event: TransportEvent,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        self.mirror
            .on_local_event(event, &mut self.state, engine, sink)
    }

    pub fn set_episode<E, S>(
        &mut self,
        episode: u32,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<Vec<Effect>>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        let loaded = self
            .mirror
            .set_episode(episode, &mut self.state, engine, sink)?;
        Ok(self.loaded_effect(&loaded).into_iter().collect())
    }

    pub fn change_resolution<E>(&mut self, resolution: Resolution, engine: &mut E) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        self.mirror
            .change_resolution(resolution, &mut self.state, engine)
    }

    pub fn synchronize<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: CommandSink + ?Sized,
    {
        self.mirror.synchronize(sink)
    }

    /// Returns false when the request was throttled.
    pub fn send_pause_request<S>(&mut self, sink: &mut S) -> Result<bool>
    where
        S: CommandSink + ?Sized,
    {
        self.send_request(RequestKind::Pause, sink)
    }

    pub fn send_rewind_request<S>(&mut self, sink: &mut S) -> Result<bool>
    where
        S: CommandSink + ?Sized,
    {
        self.send_request(RequestKind::Rewind, sink)
    }

    fn send_request<S>(&mut self, kind: RequestKind, sink: &mut S) -> Result<bool>
    where
        S: CommandSink + ?Sized,
    {
        if self.state.is_host() {
            return Err(MirrorError::NotParticipant.into());
        }
        if !self.request_limiter.try_acquire(self.state.local_now()) {
            tracing::debug!("{:?} request throttled", kind);
            return Ok(false);
        }
        let command = match kind {
            RequestKind::Pause => ClientCommand::PauseRequest,
            RequestKind::Rewind => ClientCommand::RewindBackRequest,
        };
        sink.send_command(command)?;
        Ok(true)
    }

    /// Flip a member's mute flag. Their pending cards go away when muted.
    pub fn toggle_mute(&mut self, id: MemberId) -> Option<bool> {
        let member = self
            .state
            .members
            .iter_mut()
            .find(|m| m.id == id && !m.is_me)?;
        member.muted = !member.muted;
        let muted = member.muted;
        if muted {
            self.cards.retain(|c| c.sender != id);
        }
        Some(muted)
    }

    pub fn set_mute_new_members(&mut self, mute: bool) {
        self.state.mute_new_members = mute;
    }

    /// Drop cards past their lifetime, re-probe the clock when due.
    pub fn tick<S>(&mut self, sink: &mut S) -> Result<Vec<Effect>>
    where
        S: CommandSink + ?Sized,
    {
        let local_now = self.state.local_now();
        let (expired, live): (Vec<_>, Vec<_>) = self
            .cards
            .drain(..)
            .partition(|c| c.expires_at <= local_now);
        self.cards = live;

        let joined = matches!(
            self.mirror.state(),
            MirrorState::Following | MirrorState::Driving
        );
        if joined && self.state.clock_sync.probe_due(local_now) {
            if let Some(probe) = self.state.clock_sync.request_reference_time(local_now) {
                sink.send_command(probe)?;
            }
        }
        Ok(expired.into_iter().map(Effect::RequestDismissed).collect())
    }

    pub fn leave<S>(&mut self, sink: &mut S) -> Result<()>
    where
        S: CommandSink + ?Sized,
    {
        if self.mirror.state() == MirrorState::Left {
            return Ok(());
        }
        tracing::info!("Leaving room");
        self.mirror.leave();
        self.cards.clear();
        sink.send_command(ClientCommand::LeaveRoom)
    }

    pub fn share_url(&self) -> String {
        build_watch_url(
            self.state.title_id,
            self.state.playback.episode,
            self.state.room_id.as_deref(),
        )
    }
}
