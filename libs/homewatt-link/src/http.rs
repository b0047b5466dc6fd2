//! HTTP connection wrapper
//!
//! A connection targets one endpoint (`base_url` + `path`) with a fixed method.
//! `init()` builds the client and checks that `base_url` answers with a 2xx.
//! `execute()` issues exactly one request and hands the raw response to a
//! handler while the connection lock is held.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use errors::{HomewattError, HomewattResult};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{notify, ConnectionState, LinkEvent, LinkObserver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Static configuration of one HTTP endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    /// Log and metric label
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: RequestMethod,
    /// JSON body sent with POST requests
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Devices with self-signed certificates need this
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl HttpSettings {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            path: path.into(),
            method: RequestMethod::Get,
            body: None,
            timeout: default_timeout(),
            accept_invalid_certs: false,
            basic_auth: None,
        }
    }

    pub fn with_method(mut self, method: RequestMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.basic_auth = Some(BasicAuth {
            username: username.into(),
            password,
        });
        self
    }

    /// Base URL with a scheme, no trailing slash
    pub fn base(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            base.to_string()
        } else {
            format!("http://{}", base)
        }
    }

    /// Full URL requested by `execute()`
    pub fn target_url(&self) -> String {
        let path = self.path.trim_start_matches('/');
        format!("{}/{}", self.base(), path)
    }

    fn build_client(&self) -> HomewattResult<Client> {
        Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| HomewattError::Internal(format!("{}: cannot build HTTP client: {}", self.name, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.basic_auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
            None => request,
        }
    }
}

struct HttpSession {
    client: Option<Client>,
    state: ConnectionState,
}

/// Mutex-guarded HTTP session
///
/// The lock is held for the whole request plus handler, so calls on one
/// connection are strictly serialized. Handlers should be quick and must not
/// call back into the same connection.
pub struct HttpConnection {
    settings: HttpSettings,
    session: Mutex<HttpSession>,
    observer: Option<Arc<dyn LinkObserver>>,
}

impl HttpConnection {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(HttpSession {
                client: None,
                state: ConnectionState::Uninitialized,
            }),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    pub async fn state(&self) -> ConnectionState {
        self.session.lock().await.state
    }

    /// Build the client and probe `base_url`
    ///
    /// A no-op once the connection is ready. After a failure the whole
    /// procedure runs again.
    pub async fn init(&self) -> HomewattResult<()> {
        let mut session = self.session.lock().await;
        if session.state == ConnectionState::Ready && session.client.is_some() {
            return Ok(());
        }

        info!("[{}] Initializing HTTP connection to {}", self.settings.name, self.settings.base());
        session.state = ConnectionState::Initializing;

        let result = match self.settings.build_client() {
            Ok(client) => self.probe(&client).await.map(|_| client),
            Err(e) => Err(e),
        };

        match result {
            Ok(client) => {
                session.client = Some(client);
                session.state = ConnectionState::Ready;
                notify(&self.observer, &self.settings.name, LinkEvent::Initialized);
                Ok(())
            },
            Err(e) => {
                error!("[{}] HTTP connection test failed: {}", self.settings.name, e);
                session.client = None;
                session.state = ConnectionState::Failed;
                notify(&self.observer, &self.settings.name, LinkEvent::InitFailed);
                Err(e)
            },
        }
    }

    async fn probe(&self, client: &Client) -> HomewattResult<()> {
        let url = format!("{}/", self.settings.base());
        let response = self
            .settings
            .authorize(client.get(&url))
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        if status.is_success() {
            debug!("[{}] Liveness probe answered {}", self.settings.name, status);
            Ok(())
        } else {
            Err(HomewattError::UnexpectedStatus {
                endpoint: url,
                status: status.as_u16(),
            })
        }
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> HomewattError {
        if e.is_timeout() {
            HomewattError::Timeout(url.to_string())
        } else if e.is_connect() || e.is_request() {
            HomewattError::ConnectionFailed {
                endpoint: url.to_string(),
                reason: e.to_string(),
            }
        } else {
            HomewattError::HttpClient(e)
        }
    }

    /// Issue the configured request and pass the response to `handler`
    ///
    /// Fails with `NotInitialized` without touching the network unless
    /// `init()` succeeded before. The handler's result is returned as-is, so a
    /// handler may reject a 404 or an unexpected payload.
    pub async fn execute<T, F, Fut>(&self, handler: F) -> HomewattResult<T>
    where
        F: FnOnce(Response) -> Fut,
        Fut: Future<Output = HomewattResult<T>>,
    {
        let mut session = self.session.lock().await;
        let client = match session.client.clone() {
            Some(client) => client,
            None => return Err(HomewattError::NotInitialized(self.settings.name.clone())),
        };

        if session.state == ConnectionState::Failed {
            warn!("[{}] Reinitializing HTTP connection", self.settings.name);
            session.state = ConnectionState::Initializing;
            if let Err(e) = self.probe(&client).await {
                session.state = ConnectionState::Failed;
                return Err(e);
            }
            session.state = ConnectionState::Ready;
            notify(&self.observer, &self.settings.name, LinkEvent::Reinitialized);
        }

        let url = self.settings.target_url();
        debug!("[{}] {:?} {}", self.settings.name, self.settings.method, url);

        let request = match self.settings.method {
            RequestMethod::Get => client.get(&url),
            RequestMethod::Post => match &self.settings.body {
                Some(body) => client.post(&url).json(body),
                None => client.post(&url),
            },
        };

        let response = match self.settings.authorize(request).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("[{}] Error while executing HTTP request: {}", self.settings.name, e);
                session.state = ConnectionState::Failed;
                notify(&self.observer, &self.settings.name, LinkEvent::RequestFailed);
                return Err(self.transport_error(&url, e));
            },
        };

        let result = handler(response).await;
        drop(session);
        result
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("name", &self.settings.name)
            .field("url", &self.settings.target_url())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_target_url_joins_path() {
        let settings = HttpSettings::new("t", "http://127.0.0.1:15003/", "test");
        assert_eq!(settings.target_url(), "http://127.0.0.1:15003/test");

        let settings = HttpSettings::new("t", "http://127.0.0.1:15003", "/test");
        assert_eq!(settings.target_url(), "http://127.0.0.1:15003/test");

        let settings = HttpSettings::new("t", "http://127.0.0.1:15003", "");
        assert_eq!(settings.target_url(), "http://127.0.0.1:15003/");
    }

    #[test]
    fn test_scheme_added_when_missing() {
        let settings = HttpSettings::new("fronius", "192.168.1.20", "solar_api/v1/GetPowerFlowRealtimeData.fcgi");
        assert_eq!(
            settings.target_url(),
            "http://192.168.1.20/solar_api/v1/GetPowerFlowRealtimeData.fcgi"
        );
        let settings = HttpSettings::new("senec", "https://senec.local", "lala.cgi");
        assert_eq!(settings.base(), "https://senec.local");
    }

    #[test]
    fn test_method_deserializes_uppercase() {
        let m: RequestMethod = serde_json::from_str("\"POST\"").unwrap_or_default();
        assert_eq!(m, RequestMethod::Post);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_refused_init_is_logged() {
        let conn = HttpConnection::new(
            HttpSettings::new("fronius", "127.0.0.1:1", "solar_api").with_timeout(Duration::from_secs(1)),
        );
        let err = conn.init().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(conn.state().await, ConnectionState::Failed);
        assert!(logs_contain("HTTP connection test failed"));
    }
}
