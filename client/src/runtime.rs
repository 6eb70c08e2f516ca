//! Single-task event loop for one room: server events, terminal commands and
//! timers all funnel through here, so the session never needs a lock.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::catalog::CatalogClient;
use crate::clock::Clock;
use crate::console::{describe_effect, parse_room_command, room_help, RoomCommand};
use crate::constants::VOLUME_DEBOUNCE;
use crate::player::{MediaEngine, VirtualPlayer};
use crate::prefs::PreferenceStore;
use crate::protocol::{CommandSink, ServerEvent};
use crate::session::{Effect, Navigation, RoomSession};
use crate::throttle::Debouncer;
use crate::utils::format_time;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on engine echo rounds handled after one input
const MAX_ECHO_ROUNDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomExit {
    Left,
    Navigate(Navigation),
    Disconnected,
    InputClosed,
}

pub struct RoomRuntime<S: CommandSink> {
    session: RoomSession,
    engine: VirtualPlayer,
    sink: S,
    prefs: Arc<PreferenceStore>,
    catalog: Option<CatalogClient>,
    clock: Arc<dyn Clock>,
    volume: Debouncer<f64>,
    exit: Option<RoomExit>,
    output: Vec<String>,
    echo_output: bool,
}

impl<S: CommandSink> RoomRuntime<S> {
    pub fn new(
        session: RoomSession,
        engine: VirtualPlayer,
        sink: S,
        prefs: Arc<PreferenceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            engine,
            sink,
            prefs,
            catalog: None,
            clock,
            volume: Debouncer::new(VOLUME_DEBOUNCE),
            exit: None,
            output: Vec::new(),
            echo_output: true,
        }
    }

    /// Catalog used to fetch the title when joining by room code
    pub fn with_catalog(mut self, catalog: CatalogClient) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Collect output lines instead of printing them
    pub fn quiet(mut self) -> Self {
        self.echo_output = false;
        self
    }

    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    pub fn engine(&self) -> &VirtualPlayer {
        &self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    pub fn exit(&self) -> Option<&RoomExit> {
        self.exit.as_ref()
    }

    fn say(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.echo_output {
            println!("{line}");
        }
        self.output.push(line);
    }

    /// Apply the stored volume and enter the room.
    pub async fn start(&mut self) -> Result<()> {
        let volume = self.prefs.preferences().volume;
        self.engine.set_volume(volume)?;
        let effects = self.session.open(&mut self.engine, &mut self.sink)?;
        self.process_effects(effects).await;
        Ok(())
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ServerEvent>,
        lines: &mut mpsc::UnboundedReceiver<String>,
        mut closed: oneshot::Receiver<()>,
    ) -> Result<(RoomExit, S)> {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_server_event(event).await,
                    None => self.exit = self.exit.take().or(Some(RoomExit::Disconnected)),
                },
                line = lines.recv() => match line {
                    Some(line) => self.on_line(&line).await,
                    None => {
                        self.leave();
                        self.exit = Some(RoomExit::InputClosed);
                    }
                },
                _ = ticker.tick() => self.on_tick(),
                _ = &mut closed => {
                    if self.exit.is_none() {
                        tracing::warn!("Lost connection to the room server");
                        self.say("Disconnected from the room server");
                        self.exit = Some(RoomExit::Disconnected);
                    }
                }
            }

            if let Some(exit) = self.exit.take() {
                self.flush_volume(true);
                return Ok((exit, self.sink));
            }
        }
    }

    pub async fn on_server_event(&mut self, event: ServerEvent) {
        match self
            .session
            .handle_event(event, &mut self.engine, &mut self.sink)
        {
            Ok(effects) => {
                self.pump_engine();
                self.process_effects(effects).await;
            }
            Err(e) => tracing::warn!("Failed to apply server event: {:#}", e),
        }
    }

    pub async fn on_line(&mut self, line: &str) {
        match parse_room_command(line) {
            Ok(command) => {
                if let Err(e) = self.apply(command).await {
                    self.say(format!("Error: {e:#}"));
                }
                self.pump_engine();
            }
            Err(e) => self.say(e.to_string()),
        }
    }

    pub fn on_tick(&mut self) {
        match self.session.tick(&mut self.sink) {
            Ok(effects) => {
                for effect in effects {
                    tracing::trace!("{:?}", effect);
                }
            }
            Err(e) => tracing::warn!("Session tick failed: {:#}", e),
        }
        self.flush_volume(false);
    }

    fn flush_volume(&mut self, force: bool) {
        let now = if force { f64::INFINITY } else { self.clock.now() };
        if let Some(volume) = self.volume.poll(now) {
            if let Err(e) = self.prefs.update_volume(volume) {
                tracing::warn!("Failed to save volume: {:#}", e);
            }
        }
    }

    /// Feed engine transport events back into the session until it settles.
    fn pump_engine(&mut self) {
        for _ in 0..MAX_ECHO_ROUNDS {
            let events = self.engine.poll_events();
            if events.is_empty() {
                return;
            }
            for event in events {
                if let Err(e) =
                    self.session
                        .handle_local_event(event, &mut self.engine, &mut self.sink)
                {
                    tracing::warn!("Failed to handle {:?}: {:#}", event, e);
                }
            }
        }
        tracing::debug!("Engine still raising events after {} rounds", MAX_ECHO_ROUNDS);
    }

    async fn process_effects(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match &effect {
                Effect::EpisodeLoaded {
                    title_id,
                    episode,
                    episodes_count,
                    ..
                } => {
                    if let Err(e) = self
                        .prefs
                        .record_episode(*title_id, *episode, *episodes_count)
                    {
                        tracing::warn!("Failed to update history: {:#}", e);
                    }
                }
                Effect::TitleRequired(title_id) => self.fetch_title(*title_id).await,
                Effect::Navigate(target) => self.exit = Some(RoomExit::Navigate(target.clone())),
                _ => {}
            }
            if let Some(line) = describe_effect(&effect) {
                self.say(line);
            }
            if let Effect::EpisodeLoaded { episode, .. } = effect {
                if let Some(preview) = self.preview_url(episode) {
                    self.say(format!("Preview: {preview}"));
                }
            }
        }
    }

    fn preview_url(&self, episode: u32) -> Option<String> {
        let catalog = self.catalog.as_ref()?;
        self.session
            .state()
            .title
            .as_ref()?
            .preview_url(episode, catalog.storage_url())
    }

    async fn fetch_title(&mut self, title_id: u64) {
        let Some(catalog) = self.catalog.clone() else {
            tracing::warn!("No catalog configured; cannot load title {}", title_id);
            return;
        };
        match catalog.get_title(title_id).await {
            Ok(title) => {
                match self
                    .session
                    .provide_title(title, &mut self.engine, &mut self.sink)
                {
                    Ok(effects) => {
                        self.pump_engine();
                        Box::pin(self.process_effects(effects)).await;
                    }
                    Err(e) => tracing::warn!("Failed to load title {}: {:#}", title_id, e),
                }
            }
            Err(e) => {
                tracing::error!("Failed to fetch title {}: {}", title_id, e);
                self.say(format!("Could not load title {title_id}: {e}"));
            }
        }
    }

    async fn apply(&mut self, command: RoomCommand) -> Result<()> {
        match command {
            RoomCommand::Play => self.engine.play()?,
            RoomCommand::Pause => self.engine.pause()?,
            RoomCommand::Seek(position) => self.engine.seek(position)?,
            RoomCommand::Forward(secs) => {
                let target = self.engine.position() + secs;
                self.engine.seek(target)?;
            }
            RoomCommand::Back(secs) => {
                let target = self.engine.position() - secs;
                self.engine.seek(target)?;
            }
            RoomCommand::Episode(episode) => {
                let effects = self
                    .session
                    .set_episode(episode, &mut self.engine, &mut self.sink)?;
                self.process_effects(effects).await;
            }
            RoomCommand::Quality(resolution) => {
                self.session
                    .change_resolution(resolution, &mut self.engine)?;
                self.prefs.update_resolution(resolution)?;
                self.say(format!("Quality set to {resolution}"));
            }
            RoomCommand::Sync => self.session.synchronize(&mut self.sink)?,
            RoomCommand::AskPause => {
                if !self.session.send_pause_request(&mut self.sink)? {
                    self.say("Wait a moment before asking again");
                }
            }
            RoomCommand::AskRewind => {
                if !self.session.send_rewind_request(&mut self.sink)? {
                    self.say("Wait a moment before asking again");
                }
            }
            RoomCommand::Mute(id) => match self.session.toggle_mute(id) {
                Some(true) => self.say(format!("{} muted", id.label())),
                Some(false) => self.say(format!("{} unmuted", id.label())),
                None => self.say(format!("No member {id}")),
            },
            RoomCommand::MuteNew(mute) => self.session.set_mute_new_members(mute),
            RoomCommand::Volume(level) => {
                self.engine.set_volume(level)?;
                self.volume.submit(self.engine.volume(), self.clock.now());
            }
            RoomCommand::Stall => self.engine.stall(),
            RoomCommand::Resume => self.engine.resume(),
            RoomCommand::Members => {
                let lines: Vec<String> = self
                    .session
                    .state()
                    .members
                    .iter()
                    .map(|m| {
                        let mut line = format!("  {}", m.id.label());
                        if Some(m.id) == self.session.state().host {
                            line.push_str(" [host]");
                        }
                        if m.is_me {
                            line.push_str(" (you)");
                        }
                        if m.muted {
                            line.push_str(" muted");
                        }
                        line
                    })
                    .collect();
                for line in lines {
                    self.say(line);
                }
            }
            RoomCommand::Status => {
                let state = self.session.state();
                let transport = if self.engine.is_stalled() {
                    "buffering"
                } else if state.playback.paused {
                    "paused"
                } else {
                    "playing"
                };
                let clock = if state.clock_sync.is_calibrated() {
                    format!("clock offset {:+.3}s", state.clock_sync.correction())
                } else {
                    "clock not calibrated".to_string()
                };
                let mut lines = vec![format!(
                    "{:?} | episode {} | {} | {} {} | {}",
                    self.session.mirror_state(),
                    state.playback.episode,
                    state.playback.resolution,
                    transport,
                    format_time(state.playback.position),
                    clock,
                )];
                if let Some(traffic) = self.sink.traffic() {
                    lines.push(format!("Link: {traffic}"));
                }
                for line in lines {
                    self.say(line);
                }
            }
            RoomCommand::Share => {
                let url = self.session.share_url();
                self.say(url);
            }
            RoomCommand::Help => {
                let help = room_help(self.session.role());
                self.say(help);
            }
            RoomCommand::Leave => {
                self.leave();
                self.exit = Some(RoomExit::Left);
            }
        }
        Ok(())
    }

    fn leave(&mut self) {
        if let Err(e) = self.session.leave(&mut self.sink) {
            tracing::warn!("Failed to send leave: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_title;
    use crate::catalog::Resolution;
    use crate::clock::ManualClock;
    use crate::connection::TrafficSnapshot;
    use crate::protocol::{ClientCommand, MemberId};
    use crate::session::{RoomEntry, SessionState};

    struct Rig<S: CommandSink = Vec<ClientCommand>> {
        clock: ManualClock,
        runtime: RoomRuntime<S>,
        _dir: tempfile::TempDir,
    }

    /// Sink standing in for a live socket that has seen some traffic
    #[derive(Default)]
    struct MeteredSink {
        sent: Vec<ClientCommand>,
    }

    impl CommandSink for MeteredSink {
        fn send_command(&mut self, command: ClientCommand) -> anyhow::Result<()> {
            self.sent.push(command);
            Ok(())
        }

        fn traffic(&self) -> Option<TrafficSnapshot> {
            Some(TrafficSnapshot {
                bytes_out: 64,
                bytes_in: 256,
                messages_out: self.sent.len() as u64,
                messages_in: 4,
                malformed_in: 1,
                last_rtt_ms: Some(42.0),
            })
        }
    }

    async fn rig_with<S: CommandSink>(
        me: u64,
        host: u64,
        sink: S,
        catalog: Option<CatalogClient>,
    ) -> Rig<S> {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Arc::new(PreferenceStore::at(dir.path().join("prefs.json")));
        let clock = ManualClock::new(100.0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let state = SessionState::new(Arc::clone(&shared), Some(sample_title()), 1, Resolution::Hd);
        let session = RoomSession::new(
            RoomEntry::Join {
                room_id: "r1".into(),
            },
            state,
        );
        let engine = VirtualPlayer::new(Arc::clone(&shared));
        let mut runtime = RoomRuntime::new(session, engine, sink, prefs, shared).quiet();
        if let Some(catalog) = catalog {
            runtime = runtime.with_catalog(catalog);
        }
        runtime.start().await.unwrap();

        let mut members = vec![MemberId(host)];
        if me != host {
            members.push(MemberId(me));
        }
        runtime
            .on_server_event(ServerEvent::Init {
                room_id: "r1".into(),
                members,
                me: MemberId(me),
                host: MemberId(host),
                title_id: Some(9419),
                episode: Some(1),
            })
            .await;
        Rig {
            clock,
            runtime,
            _dir: dir,
        }
    }

    async fn rig(me: u64, host: u64) -> Rig {
        let mut rig = rig_with(me, host, Vec::new(), None).await;
        rig.runtime.sink.clear();
        rig
    }

    #[tokio::test]
    async fn test_host_commands_reach_the_room() {
        let mut rig = rig(1, 1).await;
        rig.runtime.on_line("seek 1:00").await;
        rig.runtime.on_line("play").await;
        rig.runtime.on_line("pause").await;
        assert_eq!(
            rig.runtime.sink(),
            &vec![
                ClientCommand::Seek {
                    time: 100.0,
                    playback_time: 60.0
                },
                ClientCommand::Play {
                    time: 100.0,
                    playback_time: 60.0
                },
                ClientCommand::Pause,
            ]
        );
    }

    #[tokio::test]
    async fn test_participant_follows_without_echo() {
        let mut rig = rig(2, 1).await;
        rig.clock.set(101.0);
        rig.runtime
            .on_server_event(ServerEvent::Play {
                time: 100.0,
                playback_time: 30.0,
            })
            .await;
        assert_eq!(rig.runtime.engine().position(), 31.0);
        assert!(rig.runtime.sink().is_empty());
    }

    #[tokio::test]
    async fn test_history_recorded_on_episode_change() {
        let mut rig = rig(1, 1).await;
        rig.runtime.on_line("episode 2").await;
        let history = rig.runtime.prefs.history();
        assert_eq!(history[0].title_id, 9419);
        assert_eq!(history[0].last_watched_episode, 2);
        assert_eq!(
            rig.runtime.sink(),
            &vec![ClientCommand::SetEpisode { episode: 2 }]
        );
    }

    #[tokio::test]
    async fn test_quality_change_is_persisted() {
        let mut rig = rig(2, 1).await;
        rig.runtime.on_line("quality sd").await;
        assert_eq!(rig.runtime.prefs.preferences().resolution, Resolution::Sd);
        assert_eq!(
            rig.runtime.session().state().playback.resolution,
            Resolution::Sd
        );
    }

    #[tokio::test]
    async fn test_volume_is_debounced_before_saving() {
        let mut rig = rig(2, 1).await;
        rig.runtime.on_line("volume 0.8").await;
        rig.runtime.on_tick();
        assert_eq!(rig.runtime.prefs.preferences().volume, 0.8);

        rig.clock.advance(0.25);
        rig.runtime.on_line("volume 0.3").await;
        rig.runtime.on_tick();
        assert_eq!(rig.runtime.prefs.preferences().volume, 0.8);

        rig.clock.advance(1.0);
        rig.runtime.on_tick();
        assert_eq!(rig.runtime.prefs.preferences().volume, 0.3);
    }

    #[tokio::test]
    async fn test_room_not_found_sets_exit() {
        let mut rig = rig(2, 1).await;
        rig.runtime
            .on_server_event(ServerEvent::Error {
                code: 1,
                message: "Room not found".into(),
            })
            .await;
        assert_eq!(
            rig.runtime.exit(),
            Some(&RoomExit::Navigate(Navigation::Title {
                title_id: 9419,
                episode: 1
            }))
        );
    }

    #[tokio::test]
    async fn test_bad_input_is_reported() {
        let mut rig = rig(1, 1).await;
        rig.runtime.on_line("ask-pause").await;
        rig.runtime.on_line("dance").await;
        assert_eq!(
            rig.runtime.output().last().map(String::as_str),
            Some("unknown command `dance`")
        );
        assert!(rig
            .runtime
            .output()
            .iter()
            .any(|line| line.starts_with("Error:")));
        assert!(rig.runtime.sink().is_empty());
    }

    #[tokio::test]
    async fn test_run_leaves_on_command() {
        let rig = rig(2, 1).await;
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel();
        let (_closed_tx, closed_rx) = oneshot::channel();
        lines_tx.send("leave".to_string()).unwrap();

        let (exit, sink) = rig
            .runtime
            .run(events_rx, &mut lines_rx, closed_rx)
            .await
            .unwrap();
        assert_eq!(exit, RoomExit::Left);
        assert_eq!(sink, vec![ClientCommand::LeaveRoom]);
    }

    #[tokio::test]
    async fn test_episode_preview_is_shown() {
        let catalog = CatalogClient::new("http://127.0.0.1:9", "https://static.example/");
        let rig = rig_with(2, 1, Vec::new(), Some(catalog)).await;
        assert!(rig
            .runtime
            .output()
            .iter()
            .any(|line| line == "Preview: https://static.example/storage/1.jpg"));
    }

    #[tokio::test]
    async fn test_no_preview_for_episode_without_one() {
        let catalog = CatalogClient::new("http://127.0.0.1:9", "https://static.example");
        let mut rig = rig_with(1, 1, Vec::new(), Some(catalog)).await;
        let before = rig.runtime.output().len();
        rig.runtime.on_line("episode 2").await;
        assert!(!rig.runtime.output()[before..]
            .iter()
            .any(|line| line.starts_with("Preview:")));
    }

    #[tokio::test]
    async fn test_status_reports_buffering_and_clock() {
        let mut rig = rig(2, 1).await;
        rig.runtime.engine.stall();
        rig.runtime.on_line("status").await;
        let status = rig.runtime.output().last().unwrap();
        assert!(status.contains("buffering"), "{status}");
        assert!(status.contains("clock not calibrated"), "{status}");
        assert!(!rig.runtime.output().iter().any(|l| l.starts_with("Link:")));
    }

    #[tokio::test]
    async fn test_status_shows_link_traffic() {
        let mut rig = rig_with(1, 1, MeteredSink::default(), None).await;
        rig.runtime.on_line("status").await;
        let output = rig.runtime.output();
        let link = output.last().unwrap();
        let sent = rig.runtime.sink().sent.len();
        assert_eq!(
            link,
            &format!("Link: {sent} sent (64 B), 4 received (256 B), 1 malformed, rtt 42 ms")
        );
        assert!(output[output.len() - 2].contains("clock not calibrated"));
    }
}
