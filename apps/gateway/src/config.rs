use std::time::Duration;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Name of the cookie carrying the session credential.
    pub session_cookie: String,
    /// Length of a rate-limit window.
    pub rate_limit_window: Duration,
    /// Events admitted per user per window.
    pub rate_limit_max_events: u32,
    /// Interval between liveness pings sent to each connection.
    pub heartbeat_interval: Duration,
    /// Maximum length (in characters) of a direct message body.
    pub max_message_length: usize,
    /// Maximum length (in characters) of a stream chat message.
    pub max_stream_chat_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4100,
            session_cookie: "drape_session".to_string(),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_events: 300,
            heartbeat_interval: Duration::from_secs(30),
            max_message_length: 5000,
            max_stream_chat_length: 500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; missing or unparsable values keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            session_cookie: std::env::var("SESSION_COOKIE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.session_cookie),
            rate_limit_window: parsed_var("RATE_LIMIT_WINDOW_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_window),
            rate_limit_max_events: parsed_var("RATE_LIMIT_MAX_EVENTS")
                .unwrap_or(defaults.rate_limit_max_events),
            heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            max_message_length: parsed_var("MAX_MESSAGE_LENGTH")
                .unwrap_or(defaults.max_message_length),
            max_stream_chat_length: parsed_var("MAX_STREAM_CHAT_LENGTH")
                .unwrap_or(defaults.max_stream_chat_length),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, %value, "ignoring unparsable config value");
            None
        }
    }
}
