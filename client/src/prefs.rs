use anyhow::{Context, Result};
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};

use crate::catalog::Resolution;
use crate::constants::HISTORY_LIMIT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_volume")]
    pub volume: f64,
}

fn default_volume() -> f64 {
    0.5
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            resolution: Resolution::default(),
            volume: default_volume(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub title_id: u64,
    pub episodes_count: u32,
    pub last_watched_episode: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    preferences: Preferences,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

/// Check if the app is running in portable mode
pub fn is_portable_mode() -> bool {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("portable.txt").exists()))
        .unwrap_or(false)
}

/// Local preferences and watch history, cached in memory and written
/// through to a JSON file.
pub struct PreferenceStore {
    path: PathBuf,
    cached: Mutex<StoredState>,
}

impl PreferenceStore {
    pub fn new() -> Self {
        Self::at(Self::resolve_path())
    }

    pub fn at(path: PathBuf) -> Self {
        let cached = Self::read_from_disk(&path);
        Self {
            path,
            cached: Mutex::new(cached),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn preferences(&self) -> Preferences {
        self.cached.lock().preferences.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.cached.lock().history.clone()
    }

    pub fn update_resolution(&self, resolution: Resolution) -> Result<()> {
        self.modify(|state| state.preferences.resolution = resolution)
    }

    pub fn update_volume(&self, volume: f64) -> Result<()> {
        let volume = (volume.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        self.modify(|state| state.preferences.volume = volume)
    }

    /// Move `title_id` to the front of the history, noting `episode`.
    ///
    /// A title seen for the first time starts at 0 watched. An entry still at
    /// 0 only moves once an episode past the first is recorded.
    pub fn record_episode(&self, title_id: u64, episode: u32, episodes_count: u32) -> Result<()> {
        tracing::debug!(
            "Updating history: title {} - {}/{}",
            title_id,
            episode,
            episodes_count
        );
        self.modify(|state| {
            let entry = match state.history.iter().position(|e| e.title_id == title_id) {
                Some(index) => {
                    let mut entry = state.history.remove(index);
                    if !(entry.last_watched_episode == 0 && episode < 2) {
                        entry.last_watched_episode = episode;
                    }
                    if episodes_count > 0 {
                        entry.episodes_count = episodes_count;
                    }
                    entry
                }
                None => HistoryEntry {
                    title_id,
                    episodes_count,
                    last_watched_episode: 0,
                },
            };
            state.history.insert(0, entry);
            state.history.truncate(HISTORY_LIMIT);
        })
    }

    pub fn remove_title(&self, title_id: u64) -> Result<()> {
        self.modify(|state| state.history.retain(|e| e.title_id != title_id))
    }

    fn modify(&self, change: impl FnOnce(&mut StoredState)) -> Result<()> {
        let mut cached = self.cached.lock();
        change(&mut cached);
        self.save(&cached)
    }

    fn save(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create preferences directory")?;
        }
        let payload = serde_json::to_vec_pretty(state)?;
        fs::write(&self.path, payload).context("Failed to write preferences")?;
        Ok(())
    }

    fn read_from_disk(path: &PathBuf) -> StoredState {
        let Ok(data) = fs::read(path) else {
            return StoredState::default();
        };
        match serde_json::from_slice::<StoredState>(&data) {
            Ok(mut state) => {
                state.history.truncate(HISTORY_LIMIT);
                state
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable preferences at {:?}: {}", path, e);
                StoredState::default()
            }
        }
    }

    fn resolve_path() -> PathBuf {
        // Check for portable mode first
        if let Some(portable_path) = Self::portable_data_path() {
            return portable_path;
        }

        if let Some(dirs) = ProjectDirs::from("com", "cowatch", "Cowatch") {
            dirs.data_dir().join("preferences.json")
        } else {
            env::temp_dir().join("cowatch-preferences.json")
        }
    }

    /// Data folder next to the exe when portable.txt sits beside it
    fn portable_data_path() -> Option<PathBuf> {
        if !is_portable_mode() {
            return None;
        }
        let exe_path = env::current_exe().ok()?;
        let exe_dir = exe_path.parent()?;
        Some(exe_dir.join("data").join("preferences.json"))
    }
}

impl Default for PreferenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PreferenceStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::at(dir.path().join("prefs.json"));
        (dir, store)
    }

    #[test]
    fn test_defaults_without_file() {
        let (_dir, store) = store();
        assert_eq!(store.preferences(), Preferences::default());
        assert!(store.history().is_empty());
    }

    #[test]
    fn test_preferences_survive_reload() {
        let (_dir, store) = store();
        store.update_resolution(Resolution::Fhd).unwrap();
        store.update_volume(0.734).unwrap();

        let reloaded = PreferenceStore::at(store.path().clone());
        assert_eq!(reloaded.preferences().resolution, Resolution::Fhd);
        assert_eq!(reloaded.preferences().volume, 0.73);
    }

    #[test]
    fn test_history_first_visit_starts_at_zero() {
        let (_dir, store) = store();
        store.record_episode(10, 1, 12).unwrap();
        assert_eq!(store.history()[0].last_watched_episode, 0);

        store.record_episode(10, 1, 12).unwrap();
        assert_eq!(store.history()[0].last_watched_episode, 0);

        store.record_episode(10, 4, 12).unwrap();
        assert_eq!(store.history()[0].last_watched_episode, 4);

        store.record_episode(10, 1, 12).unwrap();
        assert_eq!(store.history()[0].last_watched_episode, 1);
    }

    #[test]
    fn test_history_is_most_recent_first_and_capped() {
        let (_dir, store) = store();
        for id in 0..30 {
            store.record_episode(id, 1, 1).unwrap();
        }
        store.record_episode(10, 2, 1).unwrap();

        let history = store.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history[0].title_id, 10);
        assert_eq!(history[1].title_id, 29);

        store.remove_title(10).unwrap();
        assert!(store.history().iter().all(|e| e.title_id != 10));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let (_dir, store) = store();
        fs::write(store.path(), b"{ nope").unwrap();
        let reloaded = PreferenceStore::at(store.path().clone());
        assert_eq!(reloaded.preferences(), Preferences::default());
    }
}
