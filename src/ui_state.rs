use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use url::Url;

/// What the shell remembers between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiContinuityState {
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Reads the saved state. Missing, unreadable or corrupt files yield the empty state.
pub fn load_state(path: &Path) -> UiContinuityState {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<UiContinuityState>(&raw).ok())
        .unwrap_or_default()
}

pub fn save_state(path: &Path, state: &UiContinuityState) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            format!("Failed to create state dir {}: {error}", parent.display())
        })?;
    }
    let payload = serde_json::to_string(state)
        .map_err(|error| format!("Failed to encode UI state: {error}"))?;
    fs::write(path, payload)
        .map_err(|error| format!("Failed to write UI state {}: {error}", path.display()))
}

/// A saved URL is only resumed when it points at the current backend origin.
pub fn resume_url_for_origin<'a>(state: &'a UiContinuityState, origin: &str) -> Option<&'a str> {
    state
        .url
        .as_deref()
        .filter(|url| match url.strip_prefix(origin) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        })
}

/// The page an initialize URL leads to: the innermost `next` target, or `url` itself.
pub fn continuity_url(url: &str) -> String {
    let mut current = url.to_string();
    while let Some(next) = Url::parse(&current).ok().and_then(|parsed| {
        parsed
            .query_pairs()
            .find(|(key, _)| key == "next")
            .map(|(_, value)| value.into_owned())
    }) {
        if next.is_empty() {
            break;
        }
        current = next;
    }
    current
}

pub fn backend_origin(port: u16) -> String {
    format!("http://localhost:{port}")
}
