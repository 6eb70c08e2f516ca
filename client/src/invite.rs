use url::Url;
use urlencoding::encode;

use crate::constants::LINK_SCHEME;

/// Room context carried by a shareable watch link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchLink {
    pub room_id: Option<String>,
    pub title_id: Option<u64>,
    pub episode: Option<u32>,
}

pub fn build_watch_url(title_id: Option<u64>, episode: u32, room_id: Option<&str>) -> String {
    let mut params = Vec::with_capacity(3);
    if let Some(id) = title_id {
        params.push(format!("title_id={id}"));
    }
    params.push(format!("episode={episode}"));
    if let Some(room) = room_id.filter(|r| !r.is_empty()) {
        params.push(format!("room_id={}", encode(room)));
    }
    format!("{LINK_SCHEME}://watch?{}", params.join("&"))
}

/// Accepts a full link, an http(s) link, a bare query string or a bare room code.
pub fn parse_watch_url(input: &str) -> Option<WatchLink> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = if trimmed.starts_with(&format!("{LINK_SCHEME}://"))
        || trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
    {
        trimmed.to_string()
    } else if trimmed.contains('=') {
        format!("{LINK_SCHEME}://watch?{}", trimmed.trim_start_matches('?'))
    } else if is_room_code(trimmed) {
        return Some(WatchLink {
            room_id: Some(trimmed.to_string()),
            ..WatchLink::default()
        });
    } else {
        return None;
    };

    let url = Url::parse(&normalized).ok()?;
    let mut link = WatchLink::default();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "room_id" | "room" => {
                link.room_id = Some(value.into_owned()).filter(|v| !v.is_empty())
            }
            "title_id" => link.title_id = value.parse().ok(),
            "episode" => link.episode = value.parse().ok(),
            _ => {}
        }
    }

    if link.room_id.is_none() && link.title_id.is_none() {
        return None;
    }
    Some(link)
}

/// Room codes are short url-safe tokens
fn is_room_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 32
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
