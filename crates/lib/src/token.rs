//! Outbound access tokens for the messaging backend's REST API.
//!
//! A token is fetched for every send; nothing is cached between sends.

use crate::config::{self, AuthConfig};
use crate::credentials::Credential;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Scope requested with the client-secret flow.
pub const BOT_API_SCOPE: &str = "https://api.botframework.com/.default";
/// Resource requested from managed identity endpoints.
pub const BOT_API_RESOURCE: &str = "https://api.botframework.com";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";
const APP_SERVICE_API_VERSION: &str = "2019-08-01";
const ENV_IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
const ENV_IDENTITY_HEADER: &str = "IDENTITY_HEADER";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint error: {0}")]
    Api(String),
}

/// Bearer token plus its expiry when the endpoint reported one.
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of bearer tokens for outbound calls. `Ok(None)` means "send without a token".
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<Option<AccessToken>, TokenError>;
}

/// Where managed identity tokens come from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityEndpoint {
    /// App Service style: `IDENTITY_ENDPOINT` + `X-IDENTITY-HEADER`.
    AppService { url: String, header: String },
    /// Instance metadata service style: `Metadata: true`.
    Imds { url: String },
}

impl IdentityEndpoint {
    fn resolve(auth: &AuthConfig) -> Self {
        Self::select(
            auth.identity_endpoint.as_deref(),
            config::env_value(ENV_IDENTITY_ENDPOINT),
            config::env_value(ENV_IDENTITY_HEADER),
        )
    }

    /// A configured endpoint wins (IMDS style), then the App Service pair, then IMDS.
    fn select(configured: Option<&str>, env_endpoint: Option<String>, env_header: Option<String>) -> Self {
        if let Some(url) = configured.map(str::trim).filter(|s| !s.is_empty()) {
            return IdentityEndpoint::Imds {
                url: url.to_string(),
            };
        }
        match (env_endpoint, env_header) {
            (Some(url), Some(header)) => IdentityEndpoint::AppService { url, header },
            _ => IdentityEndpoint::Imds {
                url: IMDS_ENDPOINT.to_string(),
            },
        }
    }
}

/// Token endpoints answer `expires_in`/`expires_on` either as numbers or as numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Number(i64),
    Text(String),
}

impl Seconds {
    fn value(&self) -> Option<i64> {
        match self {
            Seconds::Number(n) => Some(*n),
            Seconds::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Seconds>,
    #[serde(default)]
    expires_on: Option<Seconds>,
}

impl TokenResponse {
    fn into_access_token(self) -> AccessToken {
        let expires_on = self
            .expires_on
            .as_ref()
            .and_then(Seconds::value)
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .or_else(|| {
                self.expires_in
                    .as_ref()
                    .and_then(Seconds::value)
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            });
        AccessToken {
            token: self.access_token,
            expires_on,
        }
    }
}

/// Fetches tokens according to the resolved [`Credential`].
pub struct CredentialTokenSource {
    credential: Arc<Credential>,
    client: reqwest::Client,
    token_endpoint: String,
    identity: IdentityEndpoint,
}

impl CredentialTokenSource {
    pub fn new(credential: Arc<Credential>, auth: &AuthConfig, client: reqwest::Client) -> Self {
        Self::with_identity(credential, auth, client, IdentityEndpoint::resolve(auth))
    }

    fn with_identity(
        credential: Arc<Credential>,
        auth: &AuthConfig,
        client: reqwest::Client,
        identity: IdentityEndpoint,
    ) -> Self {
        Self {
            credential,
            client,
            token_endpoint: auth.token_endpoint.trim().to_string(),
            identity,
        }
    }

    /// POST the client-credentials grant.
    async fn client_secret_token(
        &self,
        app_id: &str,
        app_password: &str,
    ) -> Result<AccessToken, TokenError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", app_id),
            ("client_secret", app_password),
            ("scope", BOT_API_SCOPE),
        ];
        let res = self
            .client
            .post(&self.token_endpoint)
            .form(&form)
            .send()
            .await?;
        read_token_response(res).await
    }

    /// GET a token from the managed identity endpoint; `client_id` selects a user-assigned identity.
    async fn identity_token(&self, client_id: Option<&str>) -> Result<AccessToken, TokenError> {
        let mut query = vec![("resource", BOT_API_RESOURCE)];
        if let Some(id) = client_id {
            query.push(("client_id", id));
        }
        let req = match &self.identity {
            IdentityEndpoint::AppService { url, header } => {
                query.push(("api-version", APP_SERVICE_API_VERSION));
                self.client
                    .get(url)
                    .header("X-IDENTITY-HEADER", header)
                    .query(&query)
            }
            IdentityEndpoint::Imds { url } => {
                query.push(("api-version", IMDS_API_VERSION));
                self.client.get(url).header("Metadata", "true").query(&query)
            }
        };
        let res = req.send().await?;
        read_token_response(res).await
    }
}

async fn read_token_response(res: reqwest::Response) -> Result<AccessToken, TokenError> {
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(TokenError::Api(format!("{} {}", status, body)));
    }
    let data: TokenResponse = res.json().await?;
    Ok(data.into_access_token())
}

#[async_trait]
impl TokenSource for CredentialTokenSource {
    async fn fetch_token(&self) -> Result<Option<AccessToken>, TokenError> {
        let token = match self.credential.as_ref() {
            Credential::Anonymous => return Ok(None),
            Credential::ClientSecret {
                app_id,
                app_password,
            } => self.client_secret_token(app_id, app_password).await?,
            Credential::ManagedIdentity { client_id, .. } => {
                self.identity_token(Some(client_id)).await?
            }
            Credential::PlatformIdentity { .. } => self.identity_token(None).await?,
        };
        log::debug!(
            "fetched {} token (expires {:?})",
            self.credential.auth_method(),
            token.expires_on
        );
        Ok(Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Query, State},
        http::HeaderMap,
        routing::{get, post},
        Form, Json, Router,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// One request seen by [`TokenServer`].
    #[derive(Debug, Clone)]
    struct TokenRequest {
        params: HashMap<String, String>,
        headers: HeaderMap,
    }

    #[derive(Clone, Default)]
    struct TokenServer {
        base_url: String,
        requests: Arc<Mutex<Vec<TokenRequest>>>,
    }

    impl TokenServer {
        async fn start() -> Self {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let server = TokenServer {
                base_url: format!("http://{}", listener.local_addr().unwrap()),
                requests: Arc::default(),
            };
            let app = Router::new()
                .route("/identity", get(identity))
                .route("/oauth2/token", post(client_credentials))
                .with_state(server.clone());
            tokio::spawn(async move {
                let _ = axum::serve(listener, app).await;
            });
            server
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        fn only_request(&self) -> TokenRequest {
            let requests = self.requests.lock().unwrap();
            assert_eq!(requests.len(), 1);
            requests[0].clone()
        }
    }

    fn token_body() -> Json<Value> {
        Json(json!({
            "access_token": "identity-token",
            "expires_on": "1506484173",
            "resource": BOT_API_RESOURCE,
            "token_type": "Bearer"
        }))
    }

    async fn identity(
        State(server): State<TokenServer>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        server.requests.lock().unwrap().push(TokenRequest { params, headers });
        token_body()
    }

    async fn client_credentials(
        State(server): State<TokenServer>,
        headers: HeaderMap,
        Form(params): Form<HashMap<String, String>>,
    ) -> Json<Value> {
        server.requests.lock().unwrap().push(TokenRequest { params, headers });
        token_body()
    }

    fn source_for(credential: Credential, identity: IdentityEndpoint, auth: &AuthConfig) -> CredentialTokenSource {
        CredentialTokenSource::with_identity(Arc::new(credential), auth, reqwest::Client::new(), identity)
    }

    #[tokio::test]
    async fn managed_identity_queries_imds_with_client_id() {
        let server = TokenServer::start().await;
        let identity = IdentityEndpoint::select(Some(server.url("/identity").as_str()), None, None);
        let source = source_for(
            Credential::ManagedIdentity {
                app_id: "bot-app".into(),
                client_id: "mi-client".into(),
            },
            identity,
            &AuthConfig::default(),
        );
        let token = source.fetch_token().await.unwrap().unwrap();
        assert_eq!(token.token, "identity-token");
        assert_eq!(token.expires_on.unwrap().timestamp(), 1506484173);

        let req = server.only_request();
        assert_eq!(req.params.get("resource").map(String::as_str), Some(BOT_API_RESOURCE));
        assert_eq!(req.params.get("client_id").map(String::as_str), Some("mi-client"));
        assert_eq!(req.params.get("api-version").map(String::as_str), Some(IMDS_API_VERSION));
        assert_eq!(req.headers.get("metadata").unwrap(), "true");
        assert!(req.headers.get("x-identity-header").is_none());
    }

    #[tokio::test]
    async fn platform_identity_uses_app_service_header() {
        let server = TokenServer::start().await;
        let identity = IdentityEndpoint::select(
            None,
            Some(server.url("/identity")),
            Some("identity-secret".into()),
        );
        let source = source_for(
            Credential::PlatformIdentity {
                app_id: "bot-app".into(),
            },
            identity,
            &AuthConfig::default(),
        );
        source.fetch_token().await.unwrap().unwrap();

        let req = server.only_request();
        assert_eq!(req.params.get("resource").map(String::as_str), Some(BOT_API_RESOURCE));
        assert_eq!(
            req.params.get("api-version").map(String::as_str),
            Some(APP_SERVICE_API_VERSION)
        );
        assert!(!req.params.contains_key("client_id"));
        assert_eq!(req.headers.get("x-identity-header").unwrap(), "identity-secret");
        assert!(req.headers.get("metadata").is_none());
    }

    #[tokio::test]
    async fn client_secret_posts_credentials_grant() {
        let server = TokenServer::start().await;
        let auth = AuthConfig {
            token_endpoint: server.url("/oauth2/token"),
            ..AuthConfig::default()
        };
        let source = CredentialTokenSource::new(
            Arc::new(Credential::ClientSecret {
                app_id: "bot-app".into(),
                app_password: "app-secret".into(),
            }),
            &auth,
            reqwest::Client::new(),
        );
        assert_eq!(source.fetch_token().await.unwrap().unwrap().token, "identity-token");

        let req = server.only_request();
        assert_eq!(req.params.get("grant_type").map(String::as_str), Some("client_credentials"));
        assert_eq!(req.params.get("client_id").map(String::as_str), Some("bot-app"));
        assert_eq!(req.params.get("client_secret").map(String::as_str), Some("app-secret"));
        assert_eq!(req.params.get("scope").map(String::as_str), Some(BOT_API_SCOPE));
    }

    #[tokio::test]
    async fn endpoint_error_carries_status() {
        let server = TokenServer::start().await;
        let identity = IdentityEndpoint::select(Some(server.url("/missing").as_str()), None, None);
        let source = source_for(
            Credential::PlatformIdentity {
                app_id: "bot-app".into(),
            },
            identity,
            &AuthConfig::default(),
        );
        let err = source.fetch_token().await.unwrap_err();
        assert!(err.to_string().contains("404"), "{}", err);
    }

    #[test]
    fn app_service_pair_needs_both_variables() {
        assert_eq!(
            IdentityEndpoint::select(None, Some("http://localhost:8081/msi/token".into()), None),
            IdentityEndpoint::Imds {
                url: IMDS_ENDPOINT.to_string()
            }
        );
        assert_eq!(
            IdentityEndpoint::select(
                Some("  "),
                Some("http://localhost:8081/msi/token".into()),
                Some("h".into())
            ),
            IdentityEndpoint::AppService {
                url: "http://localhost:8081/msi/token".into(),
                header: "h".into()
            }
        );
    }

    #[test]
    fn parses_numeric_expires_in() {
        let r: TokenResponse =
            serde_json::from_str(r#"{"token_type":"Bearer","expires_in":3599,"access_token":"t"}"#)
                .unwrap();
        let t = r.into_access_token();
        assert_eq!(t.token, "t");
        let left = t.expires_on.unwrap() - Utc::now();
        assert!(left.num_seconds() > 3500 && left.num_seconds() <= 3599);
    }

    #[test]
    fn string_expires_on_wins_over_expires_in() {
        let r: TokenResponse = serde_json::from_str(
            r#"{"access_token":"t","expires_in":"3599","expires_on":"1506484173"}"#,
        )
        .unwrap();
        let t = r.into_access_token();
        assert_eq!(t.expires_on.unwrap().timestamp(), 1506484173);
    }

    #[test]
    fn configured_identity_endpoint_is_imds_style() {
        let auth = AuthConfig {
            identity_endpoint: Some("http://127.0.0.1:9/token".into()),
            ..AuthConfig::default()
        };
        assert_eq!(
            IdentityEndpoint::resolve(&auth),
            IdentityEndpoint::Imds {
                url: "http://127.0.0.1:9/token".into()
            }
        );
    }

    #[test]
    fn debug_hides_token() {
        let t = AccessToken {
            token: "secret-token".into(),
            expires_on: None,
        };
        assert!(!format!("{:?}", t).contains("secret-token"));
    }

    #[tokio::test]
    async fn anonymous_fetches_nothing() {
        let source = CredentialTokenSource::new(
            Arc::new(Credential::Anonymous),
            &AuthConfig::default(),
            reqwest::Client::new(),
        );
        assert!(source.fetch_token().await.unwrap().is_none());
    }
}
