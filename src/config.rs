use std::env;
use std::time::Duration;

/// Desktop Chrome user agent presented to origins when the caller supplies none
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";
pub const DEFAULT_REFERER: &str = "https://megaplay.buzz/";
pub const DEFAULT_ORIGIN: &str = "https://megaplay.buzz";

/// Browser identity used whenever the inbound request omits a header
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityDefaults {
    pub user_agent: String,
    pub referer: String,
    pub origin: String,
}

impl Default for IdentityDefaults {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: DEFAULT_REFERER.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
        }
    }
}

/// Timeouts and redirect policy for origin fetches
#[derive(Clone, Debug, PartialEq)]
pub struct UpstreamLimits {
    pub connect_timeout: Duration,
    /// Total budget for fetching and buffering a manifest
    pub manifest_timeout: Duration,
    /// Total budget for a segment transfer (segments may be large)
    pub segment_timeout: Duration,
    pub max_redirects: usize,
}

impl Default for UpstreamLimits {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            manifest_timeout: Duration::from_secs(15),
            segment_timeout: Duration::from_secs(30),
            max_redirects: 5,
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Externally visible address embedded in rewritten playlists, without trailing slash
    pub public_url: String,
    pub identity: IdentityDefaults,
    pub upstream: UpstreamLimits,
}

impl Config {
    /// Load configuration from environment variables.
    /// Every variable is optional; malformed numbers are rejected.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port: u16 = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| format!("PORT must be a valid port number: {e}"))?;

        // PUBLIC_URL wins over the bind address when running behind a reverse proxy
        let public_url = env::var("PUBLIC_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("http://{}:{}", host, port))
            .trim_end_matches('/')
            .to_string();

        let defaults = IdentityDefaults::default();
        let identity = IdentityDefaults {
            user_agent: env::var("DEFAULT_USER_AGENT").unwrap_or(defaults.user_agent),
            referer: env::var("DEFAULT_REFERER").unwrap_or(defaults.referer),
            origin: env::var("DEFAULT_ORIGIN").unwrap_or(defaults.origin),
        };

        let limits = UpstreamLimits::default();
        let upstream = UpstreamLimits {
            connect_timeout: secs_var("CONNECT_TIMEOUT_SECS", limits.connect_timeout)?,
            manifest_timeout: secs_var("MANIFEST_TIMEOUT_SECS", limits.manifest_timeout)?,
            segment_timeout: secs_var("SEGMENT_TIMEOUT_SECS", limits.segment_timeout)?,
            max_redirects: match env::var("MAX_REDIRECTS") {
                Ok(v) => v
                    .parse()
                    .map_err(|e| format!("MAX_REDIRECTS must be a number: {e}"))?,
                Err(_) => limits.max_redirects,
            },
        };

        Ok(Config {
            host,
            port,
            public_url,
            identity,
            upstream,
        })
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration, String> {
    match env::var(name) {
        Ok(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| format!("{name} must be a whole number of seconds: {e}")),
        Err(_) => Ok(default),
    }
}
