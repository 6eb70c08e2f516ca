use anyhow::{Context, Result};
use serde::Deserialize;
use std::cmp::Ordering;

use crate::constants::{HTTP_TIMEOUT, VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateInfo {
    pub current_version: String,
    pub latest_version: String,
    pub release_url: String,
    pub is_update_available: bool,
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    html_url: String,
}

/// Ask the releases API for the latest published version
pub async fn check_for_updates(releases_url: &str) -> Result<UpdateInfo> {
    let client = reqwest::Client::builder()
        .user_agent(concat!("cowatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(releases_url)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await
        .context("Failed to fetch release info")?;

    if !response.status().is_success() {
        anyhow::bail!("Releases API returned status: {}", response.status());
    }

    let release: Release = response
        .json()
        .await
        .context("Failed to parse release info")?;
    Ok(evaluate_release(release, VERSION))
}

fn evaluate_release(release: Release, current: &str) -> UpdateInfo {
    let latest_version = release.tag_name.trim_start_matches('v').to_string();
    UpdateInfo {
        is_update_available: compare_versions(current, &latest_version) == Ordering::Less,
        current_version: current.to_string(),
        latest_version,
        release_url: release.html_url,
    }
}

/// Compare dotted versions (e.g., "1.2.3" vs "1.3.0"); anything after a
/// `-` is ignored.
fn compare_versions(current: &str, latest: &str) -> Ordering {
    let parse_version = |v: &str| -> Vec<u32> {
        v.split('-')
            .next()
            .unwrap_or_default()
            .split('.')
            .filter_map(|part| part.parse::<u32>().ok())
            .collect()
    };

    let current_parts = parse_version(current);
    let latest_parts = parse_version(latest);

    for i in 0..3 {
        let c = current_parts.get(i).copied().unwrap_or(0);
        let l = latest_parts.get(i).copied().unwrap_or(0);
        match c.cmp(&l) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_comparison() {
        assert_eq!(compare_versions("1.0.0", "1.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.0", "1.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0.1", "1.0.0"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0", "1.1.0"), Ordering::Less);
        assert_eq!(compare_versions("0.9", "0.9.0"), Ordering::Equal);
        assert_eq!(compare_versions("0.1.0", "0.2.0-beta"), Ordering::Less);
    }

    #[test]
    fn test_release_tag_is_stripped() {
        let info = evaluate_release(
            Release {
                tag_name: "v0.3.1".into(),
                html_url: "https://example.org/releases/v0.3.1".into(),
            },
            "0.1.0",
        );
        assert_eq!(info.latest_version, "0.3.1");
        assert!(info.is_update_available);

        let info = evaluate_release(
            Release {
                tag_name: "0.1.0".into(),
                html_url: String::new(),
            },
            "0.1.0",
        );
        assert!(!info.is_update_available);
    }
}
