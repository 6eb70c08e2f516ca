use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:8001";
pub const CATALOG_API_URL: &str = "https://api.anilibria.tv/v3";
pub const CATALOG_STORAGE_URL: &str = "https://static.wwnd.space";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// GitHub API URL for checking releases
pub const GITHUB_RELEASES_API: &str =
    "https://api.github.com/repos/AlexDev505/AniTogether/releases/latest";

/// Scheme used by shareable watch links
pub const LINK_SCHEME: &str = "cowatch";

/// Error code the room server uses for "room does not exist"
pub const ROOM_NOT_FOUND_CODE: i64 = 1;

/// Minimum spacing between two advisory requests from the same client
pub const REQUEST_COOLDOWN: Duration = Duration::from_secs(2);
/// How long a request card stays on the host's screen
pub const REQUEST_CARD_LIFETIME: Duration = Duration::from_millis(2200);

/// A participant stall longer than this triggers a local catch-up seek
pub const CATCH_UP_THRESHOLD_SECS: f64 = 1.0;
/// Extra seconds added on top of the stall when catching up
pub const CATCH_UP_COMPENSATION_SECS: f64 = 1.0;

pub const VOLUME_DEBOUNCE: Duration = Duration::from_secs(1);
pub const SEARCH_DEBOUNCE: Duration = Duration::from_secs(1);
pub const MIN_SEARCH_QUERY_LEN: usize = 3;
pub const SEARCH_PAGE_SIZE: usize = 10;

pub const CLOCK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const CLOCK_REPROBE_INTERVAL: Duration = Duration::from_secs(60);

pub const HISTORY_LIMIT: usize = 24;
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
