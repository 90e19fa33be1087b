//! Configuration for the session client

use std::time::Duration;

/// Where the control plane lives, in place of a browser's `window.location`.
///
/// Rendered as `protocol://hostname:port[/basePath]` with leading/trailing
/// `/` and space trimmed from the path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiLocation {
    /// URL scheme, without the trailing colon
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    /// Path segment below the host; may carry stray slashes/spaces
    pub base_path: String,
}

impl ApiLocation {
    pub fn to_url(&self) -> String {
        let base = self
            .base_path
            .trim_matches(|c: char| c == '/' || c == ' ');
        let mut url = format!("{}://{}:{}", self.protocol, self.hostname, self.port);
        if !base.is_empty() {
            url.push('/');
            url.push_str(base);
        }
        url
    }
}

impl Default for ApiLocation {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            hostname: "localhost".to_string(),
            port: 80,
            base_path: String::new(),
        }
    }
}

/// Configuration for the session client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane location used to derive the base URL
    pub location: ApiLocation,
    /// Explicit base URL; takes precedence over `location` when set
    pub base_url_override: Option<String>,
    /// Allocation endpoint path on the external URL
    pub allocate_path: String,
    /// Maximum settings re-fetches while following external-URL redirection
    pub settings_max_tries: u32,
    /// Delay between settings re-fetches
    pub settings_retry_delay: Duration,
    /// How long to wait for the handshake init message
    pub init_timeout: Duration,
    /// Timeout for individual HTTP requests
    pub request_timeout: Duration,
    /// Initial backoff delay; quadruples after each retryable failure
    pub backoff_base: Duration,
    /// Retryable failures tolerated before the loop gives up
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            location: ApiLocation::default(),
            base_url_override: None,
            allocate_path: "/browser/allocate".to_string(),
            settings_max_tries: 5,
            settings_retry_delay: Duration::from_secs(1),
            init_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            max_retries: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_renders_without_base_path() {
        let location = ApiLocation {
            protocol: "https".into(),
            hostname: "example.com".into(),
            port: 443,
            base_path: String::new(),
        };
        assert_eq!(location.to_url(), "https://example.com:443");
    }

    #[test]
    fn location_trims_base_path() {
        let location = ApiLocation {
            protocol: "http".into(),
            hostname: "localhost".into(),
            port: 8080,
            base_path: " /app/ ".into(),
        };
        assert_eq!(location.to_url(), "http://localhost:8080/app");
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.allocate_path, "/browser/allocate");
        assert_eq!(config.settings_max_tries, 5);
        assert_eq!(config.init_timeout, Duration::from_secs(5));
    }
}
