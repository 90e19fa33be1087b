//! Node allocation over the control-plane HTTP API
//!
//! Single responsibility: resolve the control-plane base URL, fetch and
//! validate its settings document, follow external-URL redirection until it
//! converges, and request a node assignment. The session token rotates on
//! every allocation response.

use reqwest::header::HeaderMap;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{AllocationErrorKind, Result, SessionError};
use crate::store::SessionStorage;
use crate::types::SessionSettings;

/// Allocates backend nodes via the control plane.
pub struct NodeAllocator {
    http: reqwest::Client,
    storage: SessionStorage,
    config: ClientConfig,
}

impl NodeAllocator {
    pub fn new(config: ClientConfig, storage: SessionStorage) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            storage,
            config,
        })
    }

    /// The control-plane base URL: the configured override when set,
    /// otherwise derived from the configured location.
    pub fn resolve_base_url(&self) -> String {
        match &self.config.base_url_override {
            Some(url) => url.trim().trim_end_matches('/').to_string(),
            None => self.config.location.to_url(),
        }
    }

    /// Fetch and validate `{url}/statefull.json`.
    pub async fn fetch_settings(&self, url: &str) -> Result<SessionSettings> {
        let endpoint = format!("{}/statefull.json", url);
        debug!(url = %endpoint, "Fetching settings document");

        let response = self.http.get(&endpoint).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            return Err(SessionError::SettingsFetch { status, body });
        }

        let value: serde_json::Value = serde_json::from_str(&body)?;
        SessionSettings::from_value(&value)
    }

    /// Fetch settings repeatedly until the queried URL and the settings'
    /// declared external URL agree.
    ///
    /// Each disagreement re-fetches from the new external URL after the
    /// configured delay; more than `settings_max_tries` redirects fails with
    /// [`SessionError::Convergence`].
    pub async fn determine_settings(&self, base_url: &str) -> Result<SessionSettings> {
        let mut queried = base_url.to_string();
        let mut tries = 0u32;
        loop {
            let settings = self.fetch_settings(&queried).await?;
            if settings.external_url == queried {
                debug!(url = %queried, "Settings converged");
                return Ok(settings);
            }

            tries += 1;
            if tries > self.config.settings_max_tries {
                return Err(SessionError::Convergence {
                    last_url: queried,
                    settings_url: settings.external_url,
                });
            }

            info!(
                from = %queried,
                to = %settings.external_url,
                try_number = tries,
                "Settings point at a different external url, re-fetching"
            );
            queried = settings.external_url;
            tokio::time::sleep(self.config.settings_retry_delay).await;
        }
    }

    /// Request a node assignment from the allocation endpoint.
    ///
    /// Attaches the stored session token when present and rotates it from
    /// the response header on every call. A 401 clears the stored token and
    /// fails with `SessionExpired`; the caller must restart from allocation.
    pub async fn allocate_node(&self, settings: &SessionSettings) -> Result<String> {
        let mut path = self.config.allocate_path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let url = format!("{}{}", settings.external_url, path);
        debug!(url = %url, "Requesting node allocation");

        let mut request = self.http.get(&url);
        if let Some(token) = self.storage.session_token() {
            request = request.header(
                settings.jwt_request_header.as_str(),
                format!("{}{}", settings.jwt_request_prefix, token),
            );
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        if status == 401 {
            warn!("Session expired, clearing stored token");
            self.storage.clear_session_token();
            return Err(SessionError::Allocation(AllocationErrorKind::SessionExpired));
        }

        // Token rotation happens before status mapping; even error responses
        // carry a rotated token.
        self.rotate_session_token(settings, response.headers())?;

        match status {
            200 => {}
            500 => {
                return Err(SessionError::Allocation(
                    AllocationErrorKind::InternalServerError,
                ))
            }
            404 => return Err(SessionError::Allocation(AllocationErrorKind::WrongEndpoint)),
            403 => {
                return Err(SessionError::Allocation(
                    AllocationErrorKind::AllocationDenied,
                ))
            }
            other => {
                return Err(SessionError::Allocation(
                    AllocationErrorKind::UnexpectedStatus(other),
                ))
            }
        }

        let node_url = response.text().await?;
        if node_url.is_empty() {
            return Err(SessionError::Allocation(AllocationErrorKind::EmptyNodeUrl));
        }
        info!(node_url = %node_url, "Node allocated");
        Ok(node_url)
    }

    fn rotate_session_token(
        &self,
        settings: &SessionSettings,
        headers: &HeaderMap,
    ) -> Result<()> {
        let header = headers
            .get(settings.jwt_response_header.as_str())
            .ok_or_else(|| {
                SessionError::SessionProtocol(format!(
                    "'{}' header is not a set session string",
                    settings.jwt_response_header
                ))
            })?;
        let value = header.to_str().map_err(|_| {
            SessionError::SessionProtocol(format!(
                "'{}' header is not valid utf-8",
                settings.jwt_response_header
            ))
        })?;
        if value.is_empty() {
            return Err(SessionError::SessionProtocol(format!(
                "'{}' header is a empty session string",
                settings.jwt_response_header
            )));
        }
        let token = value
            .strip_prefix(settings.jwt_response_prefix.as_str())
            .ok_or_else(|| {
                SessionError::SessionProtocol(format!(
                    "'{}' header session string does not start with prefix '{}'",
                    settings.jwt_response_header, settings.jwt_response_prefix
                ))
            })?;
        if token.is_empty() {
            return Err(SessionError::SessionProtocol(format!(
                "'{}' header session token is empty",
                settings.jwt_response_header
            )));
        }

        self.storage.set_session_token(token);
        debug!("Session token rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SESSION_HEADER: &str = "x-statefull-session";

    fn settings_body(external_url: &str) -> String {
        json!({
            "externalUrl": external_url,
            "jwtRequestPrefix": "Bearer ",
            "jwtRequestHeader": "authorization",
            "jwtResponsePrefix": "Bearer ",
            "jwtResponseHeader": SESSION_HEADER,
            "nodeHashAlgorithm": "sha256",
            "nodeHashIterations": 100,
        })
        .to_string()
    }

    fn test_settings(external_url: &str) -> SessionSettings {
        SessionSettings::from_value(&serde_json::from_str(&settings_body(external_url)).unwrap())
            .unwrap()
    }

    fn allocator(base_url: &str) -> (NodeAllocator, SessionStorage) {
        let storage = SessionStorage::new(Arc::new(MemoryStore::new()));
        let config = ClientConfig {
            base_url_override: Some(base_url.to_string()),
            settings_max_tries: 2,
            settings_retry_delay: Duration::from_millis(10),
            ..Default::default()
        };
        (
            NodeAllocator::new(config, storage.clone()).unwrap(),
            storage,
        )
    }

    async fn mount_settings(server: &MockServer, external_url: &str) {
        Mock::given(method("GET"))
            .and(path("/statefull.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(settings_body(external_url), "application/json"),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn resolve_base_url_prefers_trimmed_override() {
        let (allocator, _) = allocator(" http://api.example:9000/ ");
        assert_eq!(allocator.resolve_base_url(), "http://api.example:9000");
    }

    #[tokio::test]
    async fn fetch_settings_validates_document() {
        let server = MockServer::start().await;
        mount_settings(&server, &server.uri()).await;
        let (allocator, _) = allocator(&server.uri());

        let settings = allocator.fetch_settings(&server.uri()).await.unwrap();
        assert_eq!(settings.external_url, server.uri());
        assert_eq!(settings.jwt_response_header, SESSION_HEADER);
    }

    #[tokio::test]
    async fn fetch_settings_non_200_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/statefull.json"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;
        let (allocator, _) = allocator(&server.uri());

        match allocator.fetch_settings(&server.uri()).await {
            Err(SessionError::SettingsFetch { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "down");
            }
            other => panic!("expected fetch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_settings_schema_error_names_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/statefull.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"externalUrl": 7}"#, "application/json"),
            )
            .mount(&server)
            .await;
        let (allocator, _) = allocator(&server.uri());

        match allocator.fetch_settings(&server.uri()).await {
            Err(SessionError::SettingsSchema { field }) => assert_eq!(field, "externalUrl"),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn determine_settings_converges_after_one_redirect() {
        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        // A points at B, B points at itself.
        mount_settings(&server_a, &server_b.uri()).await;
        mount_settings(&server_b, &server_b.uri()).await;
        let (allocator, _) = allocator(&server_a.uri());

        let settings = allocator.determine_settings(&server_a.uri()).await.unwrap();
        assert_eq!(settings.external_url, server_b.uri());
    }

    #[tokio::test]
    async fn determine_settings_that_never_stabilizes_fails() {
        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        let server_c = MockServer::start().await;
        // A -> B -> C -> A: never converges within settings_max_tries = 2.
        mount_settings(&server_a, &server_b.uri()).await;
        mount_settings(&server_b, &server_c.uri()).await;
        mount_settings(&server_c, &server_a.uri()).await;
        let (allocator, _) = allocator(&server_a.uri());

        match allocator.determine_settings(&server_a.uri()).await {
            Err(SessionError::Convergence { last_url, settings_url }) => {
                assert_eq!(last_url, server_c.uri());
                assert_eq!(settings_url, server_a.uri());
            }
            other => panic!("expected convergence error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn allocate_node_rotates_token_and_returns_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "Bearer fresh-token")
                    .set_body_string("ws://node.example:7000"),
            )
            .mount(&server)
            .await;
        let (allocator, storage) = allocator(&server.uri());

        let node_url = allocator
            .allocate_node(&test_settings(&server.uri()))
            .await
            .unwrap();
        assert_eq!(node_url, "ws://node.example:7000");
        assert_eq!(storage.session_token(), Some("fresh-token".to_string()));
    }

    #[tokio::test]
    async fn allocate_node_sends_stored_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .and(header("authorization", "Bearer old-token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "Bearer new-token")
                    .set_body_string("ws://node.example:7000"),
            )
            .mount(&server)
            .await;
        let (allocator, storage) = allocator(&server.uri());
        storage.set_session_token("old-token");

        allocator
            .allocate_node(&test_settings(&server.uri()))
            .await
            .unwrap();
        assert_eq!(storage.session_token(), Some("new-token".to_string()));
    }

    #[tokio::test]
    async fn allocate_node_401_clears_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let (allocator, storage) = allocator(&server.uri());
        storage.set_session_token("stale");

        match allocator.allocate_node(&test_settings(&server.uri())).await {
            Err(SessionError::Allocation(AllocationErrorKind::SessionExpired)) => {}
            other => panic!("expected session expired, got {:?}", other),
        }
        assert_eq!(storage.session_token(), None);
    }

    #[tokio::test]
    async fn allocate_node_maps_error_statuses() {
        for (status, expected) in [
            (500, AllocationErrorKind::InternalServerError),
            (404, AllocationErrorKind::WrongEndpoint),
            (403, AllocationErrorKind::AllocationDenied),
            (418, AllocationErrorKind::UnexpectedStatus(418)),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/browser/allocate"))
                .respond_with(
                    ResponseTemplate::new(status)
                        .insert_header(SESSION_HEADER, "Bearer rotated"),
                )
                .mount(&server)
                .await;
            let (allocator, storage) = allocator(&server.uri());

            match allocator.allocate_node(&test_settings(&server.uri())).await {
                Err(SessionError::Allocation(kind)) => assert_eq!(kind, expected),
                other => panic!("expected allocation error, got {:?}", other),
            }
            // Rotation still happened on the error response.
            assert_eq!(storage.session_token(), Some("rotated".to_string()));
        }
    }

    #[tokio::test]
    async fn allocate_node_missing_rotation_header_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ws://node"))
            .mount(&server)
            .await;
        let (allocator, _) = allocator(&server.uri());

        match allocator.allocate_node(&test_settings(&server.uri())).await {
            Err(SessionError::SessionProtocol(message)) => {
                assert!(message.contains(SESSION_HEADER));
            }
            other => panic!("expected session protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn allocate_node_wrong_prefix_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "Token abc")
                    .set_body_string("ws://node"),
            )
            .mount(&server)
            .await;
        let (allocator, _) = allocator(&server.uri());

        assert!(matches!(
            allocator.allocate_node(&test_settings(&server.uri())).await,
            Err(SessionError::SessionProtocol(_))
        ));
    }

    #[tokio::test]
    async fn allocate_node_empty_body_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/browser/allocate"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "Bearer tok")
                    .set_body_string(""),
            )
            .mount(&server)
            .await;
        let (allocator, _) = allocator(&server.uri());

        assert!(matches!(
            allocator.allocate_node(&test_settings(&server.uri())).await,
            Err(SessionError::Allocation(AllocationErrorKind::EmptyNodeUrl))
        ));
    }
}
