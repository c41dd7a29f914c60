//! Configuration parsing – reads a KEY=VALUE file (`birdlens.conf`).
//!
//! Credential storage lives outside this crate; a `USER_ID`/`AUTH_TOKEN`
//! pair in the file is only a convenience for headless runs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ── endpoints ────────────────────────────────────────────────────
    /// Duplex (WebSocket) endpoint of the analysis service.
    pub analysis_ws_url: String,
    /// Base URL of the backend collection service.
    pub api_base_url: String,
    /// Base URL of the eBird taxonomy reference service.
    pub ebird_base_url: String,
    pub ebird_api_token: String,

    // ── timing ───────────────────────────────────────────────────────
    /// Fixed delay between a link close and the next connection attempt.
    pub reconnect_delay: Duration,
    pub http_timeout: Duration,
    /// `None` means an in-flight analysis never expires on its own.
    pub analysis_timeout: Option<Duration>,

    // ── session ──────────────────────────────────────────────────────
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/birdlens/birdlens.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());
    Ok(from_map(&map))
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_secs = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };
    let get_url = |key: &str, default: &str| -> String {
        get(key)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default.into())
            .trim_end_matches('/')
            .to_string()
    };

    let analysis_timeout = match get_secs("ANALYSIS_TIMEOUT_SECS", 0) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    Config {
        analysis_ws_url: get_url("ANALYSIS_WS_URL", "ws://localhost:8000/ws"),
        api_base_url: get_url("API_BASE_URL", "http://localhost:8000"),
        ebird_base_url: get_url("EBIRD_BASE_URL", "https://api.ebird.org/v2"),
        ebird_api_token: get("EBIRD_API_TOKEN").unwrap_or_default(),

        reconnect_delay: Duration::from_secs(get_secs("RECONNECT_DELAY_SECS", 5)),
        http_timeout: Duration::from_secs(get_secs("HTTP_TIMEOUT_SECS", 15)),
        analysis_timeout,

        user_id: get("USER_ID").filter(|s| !s.is_empty()),
        auth_token: get("AUTH_TOKEN").filter(|s| !s.is_empty()),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────
