//! Home page backend: the title search box and the room directory.

use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::catalog::TitleSummary;
use crate::constants::{
    HTTP_TIMEOUT, MIN_SEARCH_QUERY_LEN, ROOM_NOT_FOUND_CODE, SEARCH_DEBOUNCE, VERSION,
};
use crate::protocol::episode_number;
use crate::throttle::Debouncer;

/// Search box state. Decides when a query should actually be sent and which
/// results are still worth showing.
pub struct TitleSearch {
    input: String,
    debounce: Debouncer<String>,
    results: Vec<TitleSummary>,
}

impl Default for TitleSearch {
    fn default() -> Self {
        Self::new(SEARCH_DEBOUNCE)
    }
}

impl TitleSearch {
    pub fn new(debounce: Duration) -> Self {
        Self {
            input: String::new(),
            debounce: Debouncer::new(debounce),
            results: Vec::new(),
        }
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn results(&self) -> &[TitleSummary] {
        &self.results
    }

    pub fn set_input(&mut self, text: &str, now: f64) {
        self.input = text.trim().to_string();
        if self.input.is_empty() {
            self.results.clear();
            self.debounce.cancel();
        } else if self.input.chars().count() < MIN_SEARCH_QUERY_LEN {
            self.debounce.cancel();
        } else {
            self.debounce.submit(self.input.clone(), now);
        }
    }

    /// Query that should be sent now, if any.
    pub fn poll(&mut self, now: f64) -> Option<String> {
        self.debounce.poll(now)
    }

    pub fn next_due(&self) -> Option<f64> {
        self.debounce.next_due()
    }

    /// Store results for `query` unless the input has moved on since.
    pub fn accept(&mut self, query: &str, results: Vec<TitleSummary>) -> bool {
        if query != self.input {
            tracing::debug!("Dropping stale results for {:?}", query);
            return false;
        }
        self.results = results;
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    #[serde(deserialize_with = "title_number")]
    pub title_id: u64,
    #[serde(deserialize_with = "episode_number")]
    pub episode: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("room directory error {code}: {message}")]
    Failed { code: i64, message: String },
    #[error("room directory unavailable: {0}")]
    Unavailable(String),
}

impl DirectoryError {
    pub fn is_room_missing(&self) -> bool {
        matches!(self, DirectoryError::Failed { code, .. } if *code == ROOM_NOT_FOUND_CODE)
    }
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DirectoryResponse {
    Ok(RoomInfo),
    Fail {
        code: i64,
        #[serde(default)]
        message: String,
    },
}

/// HTTP side of the room server: create rooms and look them up by code.
#[derive(Clone)]
pub struct RoomDirectory {
    http: reqwest::Client,
    base_url: String,
}

impl RoomDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_room(&self, title_id: u64, episode: u32) -> Result<RoomInfo, DirectoryError> {
        self.request(
            "/create_room",
            &[
                ("title_id", title_id.to_string()),
                ("episode", episode.to_string()),
            ],
        )
        .await
    }

    pub async fn get_room(&self, room_id: &str) -> Result<RoomInfo, DirectoryError> {
        self.request("/get_room", &[("room_id", room_id.to_string())])
            .await
    }

    async fn request(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<RoomInfo, DirectoryError> {
        let mut query = params.to_vec();
        query.push(("version", VERSION.to_string()));
        tracing::debug!("Room directory request {} with {:?}", path, query);

        let body = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&query)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?
            .text()
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
        parse_directory_response(&body)
    }
}

fn parse_directory_response(body: &str) -> Result<RoomInfo, DirectoryError> {
    match serde_json::from_str::<DirectoryResponse>(body) {
        Ok(DirectoryResponse::Ok(info)) => Ok(info),
        Ok(DirectoryResponse::Fail { code, message }) => {
            Err(DirectoryError::Failed { code, message })
        }
        Err(e) => Err(DirectoryError::Unavailable(e.to_string())),
    }
}

fn title_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid title id {text:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: u64) -> TitleSummary {
        TitleSummary {
            id,
            name: format!("Title {id}"),
            name_alt: None,
            poster: None,
        }
    }

    #[test]
    fn test_short_queries_are_not_searched() {
        let mut search = TitleSearch::default();
        search.set_input("ab", 0.0);
        assert_eq!(search.poll(10.0), None);
        search.set_input("abc", 10.0);
        assert_eq!(search.poll(10.0).as_deref(), Some("abc"));
    }

    #[test]
    fn test_typing_is_debounced() {
        let mut search = TitleSearch::default();
        search.set_input("fri", 0.0);
        assert_eq!(search.poll(0.0).as_deref(), Some("fri"));

        search.set_input("frie", 0.25);
        search.set_input("frieren", 0.5);
        assert_eq!(search.poll(1.0), None);
        assert_eq!(search.poll(1.5).as_deref(), Some("frieren"));
    }

    #[test]
    fn test_empty_input_clears_results() {
        let mut search = TitleSearch::default();
        search.set_input("frieren", 0.0);
        let query = search.poll(0.0).unwrap();
        assert!(search.accept(&query, vec![summary(1)]));
        assert_eq!(search.results().len(), 1);

        search.set_input("   ", 1.0);
        assert!(search.results().is_empty());
        assert_eq!(search.next_due(), None);
    }

    #[test]
    fn test_stale_results_are_dropped() {
        let mut search = TitleSearch::default();
        search.set_input("frieren", 0.0);
        let query = search.poll(0.0).unwrap();
        search.set_input("bocchi", 0.5);
        assert!(!search.accept(&query, vec![summary(1)]));
        assert!(search.results().is_empty());
    }

    #[test]
    fn test_directory_ok_response() {
        let info = parse_directory_response(
            r#"{"status":"ok","room_id":"k3x9","title_id":9419,"episode":"2"}"#,
        )
        .unwrap();
        assert_eq!(
            info,
            RoomInfo {
                room_id: "k3x9".into(),
                title_id: 9419,
                episode: 2
            }
        );

        let info =
            parse_directory_response(r#"{"status":"ok","room_id":"a","title_id":"7","episode":1}"#)
                .unwrap();
        assert_eq!(info.title_id, 7);
    }

    #[test]
    fn test_directory_failure_carries_code() {
        let err = parse_directory_response(
            r#"{"status":"fail","code":1,"message":"Room does not exist"}"#,
        )
        .unwrap_err();
        assert!(err.is_room_missing());

        let err = parse_directory_response("<html>").unwrap_err();
        assert!(matches!(err, DirectoryError::Unavailable(_)));
        assert!(!err.is_room_missing());
    }
}
