//! Title catalog: what can be watched and where each episode's streams live.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::constants::{HTTP_TIMEOUT, SEARCH_PAGE_SIZE};

/// Stream quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Sd,
    Hd,
    Fhd,
}

impl Resolution {
    /// Order in which an episode's available tiers are listed
    pub const PREFERENCE: [Resolution; 3] = [Resolution::Fhd, Resolution::Hd, Resolution::Sd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Sd => "sd",
            Resolution::Hd => "hd",
            Resolution::Fhd => "fhd",
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Hd
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sd" => Ok(Resolution::Sd),
            "hd" => Ok(Resolution::Hd),
            "fhd" => Ok(Resolution::Fhd),
            other => Err(format!("Unknown resolution: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TitleNames {
    #[serde(default)]
    pub ru: String,
    #[serde(default)]
    pub en: Option<String>,
    #[serde(default)]
    pub alternative: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Poster {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Posters {
    #[serde(default)]
    pub small: Option<Poster>,
    #[serde(default)]
    pub medium: Option<Poster>,
    #[serde(default)]
    pub original: Option<Poster>,
}

impl Posters {
    fn url(poster: &Option<Poster>) -> Option<&str> {
        poster.as_ref().and_then(|p| p.url.as_deref())
    }

    /// Small poster if there is one, otherwise the original
    pub fn thumbnail(&self) -> Option<&str> {
        Self::url(&self.small).or_else(|| Self::url(&self.original))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TitleKind {
    #[serde(default)]
    pub episodes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HlsSources {
    #[serde(default)]
    pub fhd: Option<String>,
    #[serde(default)]
    pub hd: Option<String>,
    #[serde(default)]
    pub sd: Option<String>,
}

impl HlsSources {
    pub fn get(&self, resolution: Resolution) -> Option<&str> {
        let path = match resolution {
            Resolution::Fhd => &self.fhd,
            Resolution::Hd => &self.hd,
            Resolution::Sd => &self.sd,
        };
        path.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeSources {
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub hls: HlsSources,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub host: String,
    /// Episode number -> streams
    #[serde(default)]
    pub list: BTreeMap<u32, EpisodeSources>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Title {
    pub id: u64,
    #[serde(default)]
    pub names: TitleNames,
    #[serde(default)]
    pub posters: Posters,
    #[serde(rename = "type", default)]
    pub kind: TitleKind,
    pub player: PlayerInfo,
}

impl Title {
    /// Declared episode count, falling back to the number of listed episodes
    pub fn episode_count(&self) -> u32 {
        self.kind
            .episodes
            .unwrap_or(self.player.list.len() as u32)
    }

    pub fn episode(&self, episode: u32) -> Option<&EpisodeSources> {
        self.player.list.get(&episode)
    }

    pub fn available_resolutions(&self, episode: u32) -> Vec<Resolution> {
        let Some(sources) = self.episode(episode) else {
            return Vec::new();
        };
        Resolution::PREFERENCE
            .into_iter()
            .filter(|res| sources.hls.get(*res).is_some())
            .collect()
    }

    /// `preferred` when the episode has it, otherwise the first available tier
    pub fn select_resolution(&self, episode: u32, preferred: Resolution) -> Option<Resolution> {
        let available = self.available_resolutions(episode);
        if available.contains(&preferred) {
            Some(preferred)
        } else {
            available.first().copied()
        }
    }

    pub fn source_url(&self, episode: u32, resolution: Resolution) -> Option<String> {
        let path = self.episode(episode)?.hls.get(resolution)?;
        Some(format!("https://{}{}", self.player.host, path))
    }

    pub fn preview_url(&self, episode: u32, storage_url: &str) -> Option<String> {
        let preview = self.episode(episode)?.preview.as_deref()?;
        Some(format!("{storage_url}{preview}"))
    }

    pub fn display_name(&self) -> &str {
        if !self.names.ru.is_empty() {
            &self.names.ru
        } else {
            self.names
                .en
                .as_deref()
                .or(self.names.alternative.as_deref())
                .unwrap_or("")
        }
    }
}

/// One search hit, trimmed down for listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleSummary {
    pub id: u64,
    pub name: String,
    pub name_alt: Option<String>,
    pub poster: Option<String>,
}

impl TitleSummary {
    pub fn from_title(title: &Title, storage_url: &str) -> Self {
        Self {
            id: title.id,
            name: title.names.ru.clone(),
            name_alt: title
                .names
                .en
                .clone()
                .filter(|n| !n.is_empty())
                .or_else(|| title.names.alternative.clone()),
            poster: title
                .posters
                .thumbnail()
                .map(|url| format!("{storage_url}{url}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog returned error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    list: Vec<Title>,
}

/// HTTP client for the title catalog API
#[derive(Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    api_url: String,
    storage_url: String,
}

impl CatalogClient {
    pub fn new(api_url: impl Into<String>, storage_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            storage_url: storage_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn storage_url(&self) -> &str {
        &self.storage_url
    }

    pub async fn get_title(&self, title_id: u64) -> Result<Title, CatalogError> {
        self.request("/title", &[("id", title_id.to_string())])
            .await
    }

    pub async fn search_titles(&self, query: &str) -> Result<Vec<TitleSummary>, CatalogError> {
        let page: SearchPage = self
            .request(
                "/title/search",
                &[
                    ("search", query.to_string()),
                    ("items_per_page", SEARCH_PAGE_SIZE.to_string()),
                ],
            )
            .await?;
        Ok(page
            .list
            .iter()
            .map(|title| TitleSummary::from_title(title, &self.storage_url))
            .collect())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, CatalogError> {
        tracing::debug!("Catalog request {} with {:?}", path, params);
        let body: serde_json::Value = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .query(params)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        parse_catalog_response(body)
    }
}

fn parse_catalog_response<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, CatalogError> {
    if let Some(error) = body.get("error") {
        let error: ApiErrorBody = serde_json::from_value(error.clone())
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        return Err(CatalogError::Api {
            code: error.code,
            message: error.message,
        });
    }
    serde_json::from_value(body).map_err(|e| CatalogError::Unavailable(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_title() -> Title {
        serde_json::from_value(json!({
            "id": 9419,
            "names": {"ru": "Провожающая в последний путь Фрирен", "en": "Sousou no Frieren", "alternative": null},
            "posters": {
                "small": {"url": null},
                "original": {"url": "/storage/releases/posters/9419/original.jpg"}
            },
            "type": {"episodes": null},
            "player": {
                "host": "cache.libria.fun",
                "list": {
                    "1": {"preview": "/storage/1.jpg", "hls": {"fhd": "/videos/1/fhd.m3u8", "hd": "/videos/1/hd.m3u8", "sd": "/videos/1/sd.m3u8"}},
                    "2": {"preview": null, "hls": {"fhd": null, "hd": "/videos/2/hd.m3u8", "sd": "/videos/2/sd.m3u8"}},
                    "3": {"hls": {"fhd": null, "hd": null, "sd": "/videos/3/sd.m3u8"}}
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_available_resolutions_are_ordered() {
        let title = sample_title();
        assert_eq!(
            title.available_resolutions(1),
            vec![Resolution::Fhd, Resolution::Hd, Resolution::Sd]
        );
        assert_eq!(title.available_resolutions(3), vec![Resolution::Sd]);
        assert!(title.available_resolutions(9).is_empty());
    }

    #[test]
    fn test_unavailable_resolution_falls_back_to_first() {
        let title = sample_title();
        assert_eq!(title.select_resolution(2, Resolution::Sd), Some(Resolution::Sd));
        assert_eq!(title.select_resolution(2, Resolution::Fhd), Some(Resolution::Hd));
        assert_eq!(title.select_resolution(3, Resolution::Hd), Some(Resolution::Sd));
        assert_eq!(title.select_resolution(9, Resolution::Hd), None);
    }

    #[test]
    fn test_source_and_preview_urls() {
        let title = sample_title();
        assert_eq!(
            title.source_url(2, Resolution::Hd).as_deref(),
            Some("https://cache.libria.fun/videos/2/hd.m3u8")
        );
        assert_eq!(title.source_url(2, Resolution::Fhd), None);
        assert_eq!(
            title.preview_url(1, "https://static.example").as_deref(),
            Some("https://static.example/storage/1.jpg")
        );
        assert_eq!(title.preview_url(2, "https://static.example"), None);
    }

    #[test]
    fn test_episode_count_falls_back_to_list() {
        let mut title = sample_title();
        assert_eq!(title.episode_count(), 3);
        title.kind.episodes = Some(28);
        assert_eq!(title.episode_count(), 28);
    }

    #[test]
    fn test_summary_uses_fallback_poster() {
        let summary = TitleSummary::from_title(&sample_title(), "https://static.example");
        assert_eq!(summary.name_alt.as_deref(), Some("Sousou no Frieren"));
        assert_eq!(
            summary.poster.as_deref(),
            Some("https://static.example/storage/releases/posters/9419/original.jpg")
        );
    }

    #[test]
    fn test_api_error_payload() {
        let err = parse_catalog_response::<Title>(
            json!({"error": {"code": 404, "message": "Release not found"}}),
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::Api { code: 404, .. }));
    }

    #[test]
    fn test_resolution_parsing() {
        assert_eq!("FHD".parse::<Resolution>(), Ok(Resolution::Fhd));
        assert!("4k".parse::<Resolution>().is_err());
        assert_eq!(Resolution::default(), Resolution::Hd);
    }
}
