//! Shared helpers: free ports, waiting for the gateway, and a recording mock backend.

#![allow(dead_code)]

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Poll `GET {base}/health` until it answers 200 (5s budget).
pub async fn wait_for_gateway(base: &str) {
    let client = reqwest::Client::new();
    let url = format!("{}/health", base);
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return,
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} did not return 200 within 5s; last error: {:?}",
        url, last_err
    );
}

/// One activity POST received by the mock backend.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub path: String,
    pub authorization: Option<String>,
    pub body: serde_json::Value,
}

/// Kid and secret of the symmetric key the mock backend publishes in its JWK set.
pub const CHANNEL_KEY_ID: &str = "channel-key-1";
pub const CHANNEL_KEY_SECRET: &[u8] = b"openid-test-signing-key";
/// `CHANNEL_KEY_SECRET`, base64url without padding.
const CHANNEL_KEY_B64: &str = "b3BlbmlkLXRlc3Qtc2lnbmluZy1rZXk";

#[derive(Clone)]
struct MockState {
    base_url: String,
    delivered: Arc<Mutex<Vec<Delivered>>>,
    status: StatusCode,
}

/// Messaging backend stand-in: records activity POSTs (any path), answers `/token` with a
/// fixed client-credentials token, and publishes signing keys under `/openid`.
pub struct MockBackend {
    pub base_url: String,
    delivered: Arc<Mutex<Vec<Delivered>>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        Self::start_with_status(StatusCode::OK).await
    }

    /// Backend that answers every activity POST with `status`.
    pub async fn start_with_status(status: StatusCode) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend addr");
        let base_url = format!("http://{}", addr);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            base_url: base_url.clone(),
            delivered: delivered.clone(),
            status,
        };
        let app = Router::new()
            .route("/token", post(token))
            .route("/openid", get(openid_metadata))
            .route("/openid/keys", get(signing_keys))
            .fallback(record)
            .with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url,
            delivered,
        }
    }

    pub fn openid_metadata_url(&self) -> String {
        format!("{}/openid", self.base_url)
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().expect("delivered lock").clone()
    }
}

async fn token() -> Json<serde_json::Value> {
    Json(json!({
        "token_type": "Bearer",
        "expires_in": 3599,
        "access_token": "outbound-token"
    }))
}

async fn openid_metadata(State(state): State<MockState>) -> Json<serde_json::Value> {
    Json(json!({
        "issuer": "https://api.botframework.com",
        "jwks_uri": format!("{}/openid/keys", state.base_url)
    }))
}

async fn signing_keys() -> Json<serde_json::Value> {
    Json(json!({
        "keys": [{ "kty": "oct", "kid": CHANNEL_KEY_ID, "alg": "HS256", "k": CHANNEL_KEY_B64 }]
    }))
}

async fn record(
    State(state): State<MockState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let body = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut delivered = state.delivered.lock().expect("delivered lock");
    delivered.push(Delivered {
        path: uri.path().to_string(),
        authorization,
        body,
    });
    let id = format!("reply-{}", delivered.len());
    (state.status, Json(json!({ "id": id })))
}
