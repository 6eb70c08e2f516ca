use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock::Clock;

/// Transport notifications a media engine raises, whether the change came
/// from the viewer or from code driving the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    /// Playback started or resumed after a pause, seek or stall
    Playing,
    Pause,
    /// A seek has begun
    Seeking,
    /// Playback stopped to buffer
    Waiting,
}

/// What the synchronization core needs from a media engine
pub trait MediaEngine {
    /// Replace the current source. Leaves the engine paused at 0.
    fn load_source(&mut self, url: &str) -> Result<()>;
    fn source(&self) -> Option<&str>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    /// Seek to a specific position (in seconds)
    fn seek(&mut self, position: f64) -> Result<()>;
    /// Current playback position (in seconds)
    fn position(&self) -> f64;
    fn is_paused(&self) -> bool;
    /// Set volume (0.0-1.0)
    fn set_volume(&mut self, volume: f64) -> Result<()>;
    fn volume(&self) -> f64;
    /// Transport events raised since the last call, oldest first
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

/// Headless engine that plays nothing and keeps time against a [`Clock`].
pub struct VirtualPlayer {
    clock: Arc<dyn Clock>,
    source: Option<String>,
    duration: Option<f64>,
    anchor_position: f64,
    anchor_time: f64,
    paused: bool,
    stalled: bool,
    volume: f64,
    events: VecDeque<TransportEvent>,
}

impl VirtualPlayer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            source: None,
            duration: None,
            anchor_position: 0.0,
            anchor_time: now,
            paused: true,
            stalled: false,
            volume: 1.0,
            events: VecDeque::new(),
        }
    }

    /// Known media length, used to clamp seeks
    pub fn set_duration(&mut self, duration: Option<f64>) {
        self.duration = duration;
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Simulate running out of buffered media
    pub fn stall(&mut self) {
        if self.stalled || self.source.is_none() {
            return;
        }
        self.rebase();
        self.stalled = true;
        self.events.push_back(TransportEvent::Waiting);
    }

    /// Simulate the buffer refilling
    pub fn resume(&mut self) {
        if !self.stalled {
            return;
        }
        self.anchor_time = self.clock.now();
        self.stalled = false;
        if !self.paused {
            self.events.push_back(TransportEvent::Playing);
        }
    }

    fn advancing(&self) -> bool {
        self.source.is_some() && !self.paused && !self.stalled
    }

    fn rebase(&mut self) {
        self.anchor_position = self.position();
        self.anchor_time = self.clock.now();
    }

    fn clamp(&self, position: f64) -> f64 {
        let position = position.max(0.0);
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }
}

impl MediaEngine for VirtualPlayer {
    fn load_source(&mut self, url: &str) -> Result<()> {
        if url.is_empty() {
            bail!("Empty media source");
        }
        self.source = Some(url.to_string());
        self.anchor_position = 0.0;
        self.anchor_time = self.clock.now();
        self.paused = true;
        self.stalled = false;
        Ok(())
    }

    fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    fn play(&mut self) -> Result<()> {
        if self.source.is_none() {
            bail!("No media source loaded");
        }
        if !self.paused {
            return Ok(());
        }
        self.rebase();
        self.paused = false;
        if !self.stalled {
            self.events.push_back(TransportEvent::Playing);
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.paused {
            return Ok(());
        }
        self.rebase();
        self.paused = true;
        self.events.push_back(TransportEvent::Pause);
        Ok(())
    }

    fn seek(&mut self, position: f64) -> Result<()> {
        if self.source.is_none() {
            bail!("No media source loaded");
        }
        self.anchor_position = self.clamp(position);
        self.anchor_time = self.clock.now();
        self.events.push_back(TransportEvent::Seeking);
        if self.advancing() {
            self.events.push_back(TransportEvent::Playing);
        }
        Ok(())
    }

    fn position(&self) -> f64 {
        if self.advancing() {
            let elapsed = (self.clock.now() - self.anchor_time).max(0.0);
            self.clamp(self.anchor_position + elapsed)
        } else {
            self.anchor_position
        }
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }
}
