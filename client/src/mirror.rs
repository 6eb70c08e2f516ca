//! Playback mirror: keeps the local player in step with the room.
//!
//! The host's engine events become protocol commands; on participants,
//! protocol events become engine calls. State-changing messages carry the
//! sender's corrected send time together with the position at that time, so
//! a receiver can extrapolate where playback should be when it handles them.

use anyhow::Result;

use crate::catalog::Resolution;
use crate::constants::{CATCH_UP_COMPENSATION_SECS, CATCH_UP_THRESHOLD_SECS};
use crate::player::{MediaEngine, TransportEvent};
use crate::protocol::{ClientCommand, CommandSink, MemberId};
use crate::session::{Role, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Idle,
    /// Join sent, role not yet known
    Initializing,
    /// Participant mirroring the host
    Following,
    /// Host whose player drives everyone else
    Driving,
    Left,
}

/// Local view of what is playing. Authoritative only on the host.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    pub episode: u32,
    pub resolution: Resolution,
    pub position: f64,
    pub paused: bool,
}

impl PlaybackState {
    pub fn new(episode: u32, resolution: Resolution) -> Self {
        Self {
            episode: normalize_episode(episode),
            resolution,
            position: 0.0,
            paused: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeLoaded {
    pub episode: u32,
    pub resolution: Resolution,
    pub source: String,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum MirrorError {
    #[error("no title is loaded")]
    NoTitle,
    #[error("episode {0} has no streams")]
    EpisodeUnavailable(u32),
    #[error("{resolution} is not available for episode {episode}")]
    ResolutionUnavailable { episode: u32, resolution: Resolution },
    #[error("only the host can do that")]
    NotHost,
    #[error("the host cannot do that")]
    NotParticipant,
}

/// Episode 0 means "not chosen yet" and plays the first one.
pub fn normalize_episode(episode: u32) -> u32 {
    episode.max(1)
}

/// Where playback should be at `now` given a position sampled at `time`.
pub fn target_position(time: f64, playback_time: f64, now: f64) -> f64 {
    playback_time + (now - time)
}

#[derive(Debug)]
pub struct PlaybackMirror {
    state: MirrorState,
    seeking: bool,
    seek_started_at: Option<f64>,
}

impl Default for PlaybackMirror {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackMirror {
    pub fn new() -> Self {
        Self {
            state: MirrorState::Idle,
            seeking: false,
            seek_started_at: None,
        }
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    pub fn begin(&mut self) {
        if self.state == MirrorState::Idle {
            self.state = MirrorState::Initializing;
        }
    }

    pub fn assume_role(&mut self, role: Role) {
        if self.state == MirrorState::Left {
            return;
        }
        self.state = match role {
            Role::Host => MirrorState::Driving,
            Role::Participant => MirrorState::Following,
        };
        self.seek_started_at = None;
    }

    pub fn leave(&mut self) {
        self.state = MirrorState::Left;
        self.seek_started_at = None;
    }

    fn following(&self, what: &str) -> bool {
        if self.state == MirrorState::Following {
            return true;
        }
        tracing::debug!("Ignoring remote {} while {:?}", what, self.state);
        false
    }

    /// Feed one transport event from the local engine.
    pub fn on_local_event<E, S>(
        &mut self,
        event: TransportEvent,
        session: &mut SessionState,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        let result = match self.state {
            MirrorState::Driving => self.drive(event, session, engine, sink),
            MirrorState::Following => self.follow(event, session, engine),
            _ => {
                tracing::trace!("Local {:?} while {:?}", event, self.state);
                Ok(())
            }
        };
        session.observe(engine);
        result
    }

    fn drive<E, S>(
        &mut self,
        event: TransportEvent,
        session: &SessionState,
        engine: &E,
        sink: &mut S,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        match event {
            TransportEvent::Playing => {
                self.seeking = false;
                sink.send_command(ClientCommand::Play {
                    time: session.now(),
                    playback_time: engine.position(),
                })
            }
            TransportEvent::Pause => sink.send_command(ClientCommand::Pause),
            TransportEvent::Seeking => {
                self.seeking = true;
                sink.send_command(ClientCommand::Seek {
                    time: session.now(),
                    playback_time: engine.position(),
                })
            }
            // Buffering holds everyone else back too, unless it is just the
            // tail of a seek.
            TransportEvent::Waiting if self.seeking => Ok(()),
            TransportEvent::Waiting => sink.send_command(ClientCommand::Pause),
        }
    }

    fn follow<E>(
        &mut self,
        event: TransportEvent,
        session: &SessionState,
        engine: &mut E,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        match event {
            TransportEvent::Playing => {
                self.seeking = false;
                if let Some(started) = self.seek_started_at.take() {
                    let stalled_for = session.now() - started;
                    if stalled_for > CATCH_UP_THRESHOLD_SECS {
                        let target =
                            engine.position() + stalled_for + CATCH_UP_COMPENSATION_SECS;
                        tracing::debug!(
                            "Stalled {:.2}s, catching up to {:.2}",
                            stalled_for,
                            target
                        );
                        engine.seek(target)?;
                    }
                }
                Ok(())
            }
            TransportEvent::Seeking => {
                self.seeking = true;
                self.seek_started_at = Some(session.now());
                Ok(())
            }
            TransportEvent::Waiting if self.seeking => Ok(()),
            TransportEvent::Waiting => {
                self.seek_started_at = Some(session.now());
                Ok(())
            }
            TransportEvent::Pause => Ok(()),
        }
    }

    pub fn on_remote_play<E>(
        &mut self,
        time: f64,
        playback_time: f64,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        if !self.following("play") {
            return Ok(());
        }
        let target = target_position(time, playback_time, session.now());
        engine.seek(target)?;
        engine.play()?;
        session.observe(engine);
        Ok(())
    }

    pub fn on_remote_pause<E>(&mut self, session: &mut SessionState, engine: &mut E) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        if !self.following("pause") {
            return Ok(());
        }
        engine.pause()?;
        session.observe(engine);
        Ok(())
    }

    /// The host is scrubbing: jump to where it is and wait there.
    pub fn on_remote_seek<E>(
        &mut self,
        time: f64,
        playback_time: f64,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        if !self.following("seek") {
            return Ok(());
        }
        let target = target_position(time, playback_time, session.now());
        engine.pause()?;
        engine.seek(target)?;
        session.observe(engine);
        Ok(())
    }

    pub fn on_playback_time_answer<E>(
        &mut self,
        time: f64,
        playback_time: f64,
        playing: bool,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        if !self.following("playback time answer") {
            return Ok(());
        }
        let target = target_position(time, playback_time, session.now());
        engine.seek(target)?;
        if playing {
            engine.play()?;
        } else {
            engine.pause()?;
        }
        session.observe(engine);
        Ok(())
    }

    /// Host side of a manual resync: report where playback is right now.
    pub fn answer_playback_time_request<E, S>(
        &self,
        user_id: MemberId,
        session: &SessionState,
        engine: &E,
        sink: &mut S,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        if self.state != MirrorState::Driving {
            tracing::debug!("Playback time request from {} while not host", user_id);
            return Ok(());
        }
        sink.send_command(ClientCommand::PlaybackTimeRequestAnswer {
            time: session.now(),
            playback_time: engine.position(),
            playing: !engine.is_paused(),
            user_id,
        })
    }

    pub fn synchronize<S>(&self, sink: &mut S) -> Result<()>
    where
        S: CommandSink + ?Sized,
    {
        if self.state == MirrorState::Driving {
            return Err(MirrorError::NotParticipant.into());
        }
        sink.send_command(ClientCommand::PlaybackTimeRequest)
    }

    /// Host switches the room to another episode.
    pub fn set_episode<E, S>(
        &mut self,
        episode: u32,
        session: &mut SessionState,
        engine: &mut E,
        sink: &mut S,
    ) -> Result<EpisodeLoaded>
    where
        E: MediaEngine + ?Sized,
        S: CommandSink + ?Sized,
    {
        if self.state != MirrorState::Driving {
            return Err(MirrorError::NotHost.into());
        }
        let episode = normalize_episode(episode);
        let title = session.title.as_ref().ok_or(MirrorError::NoTitle)?;
        if title.available_resolutions(episode).is_empty() {
            return Err(MirrorError::EpisodeUnavailable(episode).into());
        }
        sink.send_command(ClientCommand::SetEpisode { episode })?;
        self.init_episode(episode, session, engine)
    }

    pub fn on_remote_set_episode<E>(
        &mut self,
        episode: u32,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<EpisodeLoaded>
    where
        E: MediaEngine + ?Sized,
    {
        self.init_episode(episode, session, engine)
    }

    /// Load `episode`, keeping the selected tier when the episode has it and
    /// snapping to its first available tier otherwise.
    pub fn init_episode<E>(
        &mut self,
        episode: u32,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<EpisodeLoaded>
    where
        E: MediaEngine + ?Sized,
    {
        let episode = normalize_episode(episode);
        let title = session.title.as_ref().ok_or(MirrorError::NoTitle)?;
        let resolution = title
            .select_resolution(episode, session.playback.resolution)
            .ok_or(MirrorError::EpisodeUnavailable(episode))?;
        let source = title
            .source_url(episode, resolution)
            .ok_or(MirrorError::EpisodeUnavailable(episode))?;

        engine.load_source(&source)?;
        self.seek_started_at = None;
        self.seeking = false;
        session.playback.episode = episode;
        session.playback.resolution = resolution;
        session.observe(engine);
        tracing::info!("Loaded episode {} at {}", episode, resolution);

        Ok(EpisodeLoaded {
            episode,
            resolution,
            source,
        })
    }

    /// Reload the current episode at another tier, keeping position and
    /// paused/playing state.
    pub fn change_resolution<E>(
        &mut self,
        resolution: Resolution,
        session: &mut SessionState,
        engine: &mut E,
    ) -> Result<()>
    where
        E: MediaEngine + ?Sized,
    {
        let episode = session.playback.episode;
        let title = session.title.as_ref().ok_or(MirrorError::NoTitle)?;
        let source = title
            .source_url(episode, resolution)
            .ok_or(MirrorError::ResolutionUnavailable {
                episode,
                resolution,
            })?;

        let position = engine.position();
        let paused = engine.is_paused();
        engine.load_source(&source)?;
        engine.seek(position)?;
        if !paused {
            engine.play()?;
        }
        session.playback.resolution = resolution;
        session.observe(engine);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_title;
    use crate::clock::ManualClock;
    use crate::player::VirtualPlayer;
    use std::sync::Arc;

    struct Rig {
        clock: ManualClock,
        session: SessionState,
        player: VirtualPlayer,
        mirror: PlaybackMirror,
        sent: Vec<ClientCommand>,
    }

    impl Rig {
        fn new(role: Role) -> Self {
            let clock = ManualClock::new(100.0);
            let shared: Arc<dyn crate::clock::Clock> = Arc::new(clock.clone());
            let mut session =
                SessionState::new(Arc::clone(&shared), Some(sample_title()), 1, Resolution::Hd);
            let mut player = VirtualPlayer::new(shared);
            let mut mirror = PlaybackMirror::new();
            mirror.init_episode(1, &mut session, &mut player).unwrap();
            mirror.begin();
            mirror.assume_role(role);
            Self {
                clock,
                session,
                player,
                mirror,
                sent: Vec::new(),
            }
        }

        fn pump(&mut self) {
            for event in self.player.poll_events() {
                self.mirror
                    .on_local_event(event, &mut self.session, &mut self.player, &mut self.sent)
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_target_position_compensates_transit() {
        assert_eq!(target_position(100.0, 30.0, 101.0), 31.0);
        assert_eq!(target_position(50.0, 0.0, 50.0), 0.0);
    }

    #[test]
    fn test_remote_play_extrapolates_and_plays() {
        let mut rig = Rig::new(Role::Participant);
        rig.clock.set(101.0);
        rig.mirror
            .on_remote_play(100.0, 30.0, &mut rig.session, &mut rig.player)
            .unwrap();
        assert_eq!(rig.player.position(), 31.0);
        assert!(!rig.player.is_paused());
        assert!(!rig.session.playback.paused);
    }

    #[test]
    fn test_remote_play_uses_corrected_clock() {
        let mut rig = Rig::new(Role::Participant);
        // Local clock runs 2s ahead of the room.
        rig.session.clock_sync.request_reference_time(100.0);
        rig.session
            .clock_sync
            .complete_probe(100.0, 98.0, 100.0)
            .unwrap();
        rig.clock.set(103.0);
        rig.mirror
            .on_remote_play(100.0, 30.0, &mut rig.session, &mut rig.player)
            .unwrap();
        assert_eq!(rig.player.position(), 31.0);
    }

    #[test]
    fn test_remote_pause_twice_is_idempotent() {
        let mut rig = Rig::new(Role::Participant);
        rig.mirror
            .on_remote_play(100.0, 12.0, &mut rig.session, &mut rig.player)
            .unwrap();
        rig.clock.advance(3.0);
        rig.mirror
            .on_remote_pause(&mut rig.session, &mut rig.player)
            .unwrap();
        let position = rig.player.position();
        rig.clock.advance(3.0);
        rig.mirror
            .on_remote_pause(&mut rig.session, &mut rig.player)
            .unwrap();
        assert!(rig.player.is_paused());
        assert_eq!(rig.player.position(), position);
        assert_eq!(position, 15.0);
    }

    #[test]
    fn test_remote_seek_leaves_player_paused() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.clock.set(100.5);
        rig.mirror
            .on_remote_seek(100.0, 600.0, &mut rig.session, &mut rig.player)
            .unwrap();
        assert!(rig.player.is_paused());
        assert_eq!(rig.player.position(), 600.5);
    }

    #[test]
    fn test_playback_time_answer_matches_play_state() {
        let mut rig = Rig::new(Role::Participant);
        rig.clock.set(102.0);
        rig.mirror
            .on_playback_time_answer(101.0, 50.0, false, &mut rig.session, &mut rig.player)
            .unwrap();
        assert!(rig.player.is_paused());
        assert_eq!(rig.player.position(), 51.0);

        rig.mirror
            .on_playback_time_answer(101.0, 50.0, true, &mut rig.session, &mut rig.player)
            .unwrap();
        assert!(!rig.player.is_paused());
    }

    #[test]
    fn test_host_ignores_remote_control() {
        let mut rig = Rig::new(Role::Host);
        rig.mirror
            .on_remote_play(100.0, 30.0, &mut rig.session, &mut rig.player)
            .unwrap();
        assert!(rig.player.is_paused());
        assert_eq!(rig.player.position(), 0.0);
    }

    #[test]
    fn test_host_broadcasts_transport_events() {
        let mut rig = Rig::new(Role::Host);
        rig.player.seek(20.0).unwrap();
        rig.player.play().unwrap();
        rig.pump();
        rig.player.pause().unwrap();
        rig.pump();
        assert_eq!(
            rig.sent,
            vec![
                ClientCommand::Seek {
                    time: 100.0,
                    playback_time: 20.0
                },
                ClientCommand::Play {
                    time: 100.0,
                    playback_time: 20.0
                },
                ClientCommand::Pause,
            ]
        );
    }

    #[test]
    fn test_host_buffering_pauses_room_except_while_seeking() {
        let mut rig = Rig::new(Role::Host);
        rig.player.play().unwrap();
        rig.pump();
        rig.sent.clear();

        rig.player.stall();
        rig.pump();
        assert_eq!(rig.sent, vec![ClientCommand::Pause]);
        rig.player.resume();
        rig.pump();
        rig.sent.clear();

        // Seek that stalls before playback resumes.
        rig.mirror
            .on_local_event(
                TransportEvent::Seeking,
                &mut rig.session,
                &mut rig.player,
                &mut rig.sent,
            )
            .unwrap();
        rig.mirror
            .on_local_event(
                TransportEvent::Waiting,
                &mut rig.session,
                &mut rig.player,
                &mut rig.sent,
            )
            .unwrap();
        assert_eq!(rig.sent.len(), 1);
        assert!(matches!(rig.sent[0], ClientCommand::Seek { .. }));
    }

    #[test]
    fn test_participant_never_broadcasts() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.player.seek(10.0).unwrap();
        rig.player.pause().unwrap();
        rig.pump();
        assert!(rig.sent.is_empty());
    }

    #[test]
    fn test_participant_catches_up_after_long_stall() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.clock.advance(10.0);
        rig.pump();

        rig.player.stall();
        rig.pump();
        rig.clock.advance(3.0);
        rig.player.resume();
        rig.pump();
        // 10s played, frozen 3s, then skipped ahead by 3s + 1s.
        assert_eq!(rig.player.position(), 14.0);
        rig.pump();
        assert_eq!(rig.player.position(), 14.0);
    }

    #[test]
    fn test_participant_catches_up_after_slow_seek() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.seek(20.0).unwrap();
        rig.pump();
        rig.clock.advance(2.0);
        rig.player.play().unwrap();
        rig.pump();
        assert_eq!(rig.player.position(), 23.0);
        rig.pump();
        assert_eq!(rig.player.position(), 23.0);
    }

    #[test]
    fn test_participant_stall_then_seek_catches_up() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.pump();
        rig.player.stall();
        rig.pump();
        rig.mirror
            .on_local_event(
                TransportEvent::Seeking,
                &mut rig.session,
                &mut rig.player,
                &mut rig.sent,
            )
            .unwrap();
        rig.clock.advance(2.0);
        rig.player.resume();
        rig.pump();
        assert_eq!(rig.player.position(), 3.0);
        assert!(rig.sent.is_empty());
    }

    #[test]
    fn test_participant_waiting_during_seek_keeps_seek_start() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.pump();
        rig.mirror
            .on_local_event(
                TransportEvent::Seeking,
                &mut rig.session,
                &mut rig.player,
                &mut rig.sent,
            )
            .unwrap();
        rig.clock.advance(0.5);
        rig.player.stall();
        rig.pump();
        rig.clock.advance(1.0);
        rig.player.resume();
        rig.pump();
        // Measured from the seek at 100.0, not the buffering at 100.5.
        assert_eq!(rig.player.position(), 3.0);
    }

    #[test]
    fn test_participant_short_stall_is_left_alone() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.play().unwrap();
        rig.pump();
        rig.player.stall();
        rig.pump();
        rig.clock.advance(0.5);
        rig.player.resume();
        rig.pump();
        assert_eq!(rig.player.position(), 0.0);
    }

    #[test]
    fn test_host_answers_playback_time_request() {
        let mut rig = Rig::new(Role::Host);
        rig.player.seek(40.0).unwrap();
        rig.player.play().unwrap();
        rig.clock.advance(2.0);
        rig.mirror
            .answer_playback_time_request(MemberId(3), &rig.session, &rig.player, &mut rig.sent)
            .unwrap();
        assert_eq!(
            rig.sent,
            vec![ClientCommand::PlaybackTimeRequestAnswer {
                time: 102.0,
                playback_time: 42.0,
                playing: true,
                user_id: MemberId(3),
            }]
        );
    }

    #[test]
    fn test_set_episode_broadcasts_then_loads() {
        let mut rig = Rig::new(Role::Host);
        let loaded = rig
            .mirror
            .set_episode(2, &mut rig.session, &mut rig.player, &mut rig.sent)
            .unwrap();
        assert_eq!(rig.sent, vec![ClientCommand::SetEpisode { episode: 2 }]);
        assert_eq!(loaded.episode, 2);
        assert_eq!(
            rig.player.source(),
            Some("https://cache.libria.fun/videos/2/hd.m3u8")
        );
    }

    #[test]
    fn test_set_episode_requires_host() {
        let mut rig = Rig::new(Role::Participant);
        let err = rig
            .mirror
            .set_episode(2, &mut rig.session, &mut rig.player, &mut rig.sent)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<MirrorError>(), Some(&MirrorError::NotHost));
        assert!(rig.sent.is_empty());
    }

    #[test]
    fn test_episode_without_tier_snaps_to_first_available() {
        let mut rig = Rig::new(Role::Participant);
        rig.session.playback.resolution = Resolution::Fhd;
        let loaded = rig
            .mirror
            .on_remote_set_episode(3, &mut rig.session, &mut rig.player)
            .unwrap();
        assert_eq!(loaded.resolution, Resolution::Sd);
        assert_eq!(rig.session.playback.resolution, Resolution::Sd);

        let missing = rig
            .mirror
            .on_remote_set_episode(42, &mut rig.session, &mut rig.player)
            .unwrap_err();
        assert_eq!(
            missing.downcast_ref::<MirrorError>(),
            Some(&MirrorError::EpisodeUnavailable(42))
        );
    }

    #[test]
    fn test_change_resolution_round_trip_keeps_position_and_state() {
        let mut rig = Rig::new(Role::Participant);
        rig.player.seek(300.0).unwrap();
        rig.player.play().unwrap();
        rig.clock.advance(5.0);
        let original = rig.player.source().map(str::to_string);

        rig.mirror
            .change_resolution(Resolution::Sd, &mut rig.session, &mut rig.player)
            .unwrap();
        assert_eq!(rig.player.position(), 305.0);
        assert!(!rig.player.is_paused());

        rig.mirror
            .change_resolution(Resolution::Hd, &mut rig.session, &mut rig.player)
            .unwrap();
        assert_eq!(rig.player.source().map(str::to_string), original);
        assert_eq!(rig.player.position(), 305.0);
        assert!(!rig.player.is_paused());
        assert_eq!(rig.session.playback.resolution, Resolution::Hd);
    }

    #[test]
    fn test_change_resolution_rejects_missing_tier() {
        let mut rig = Rig::new(Role::Participant);
        rig.mirror
            .on_remote_set_episode(3, &mut rig.session, &mut rig.player)
            .unwrap();
        assert!(rig
            .mirror
            .change_resolution(Resolution::Fhd, &mut rig.session, &mut rig.player)
            .is_err());
        assert_eq!(rig.session.playback.resolution, Resolution::Sd);
    }
}
