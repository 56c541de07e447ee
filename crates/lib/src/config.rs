//! Configuration types and loading.
//!
//! Config is loaded from an optional JSON file (e.g. `~/.echo-bot/config.json`) and then
//! overridden by environment variables (`MicrosoftAppId`, `HOST`, `PORT`, ...).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable names recognized on top of the config file.
pub const ENV_APP_ID: &str = "MicrosoftAppId";
pub const ENV_APP_PASSWORD: &str = "MicrosoftAppPassword";
pub const ENV_MANAGED_IDENTITY_CLIENT_ID: &str = "ManagedIdentityClientId";
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";
pub const ENV_CONFIG_PATH: &str = "ECHO_BOT_CONFIG_PATH";

pub const DEFAULT_WELCOME_TEXT: &str =
    "Hello! I'm an echo bot. Send me a message and I'll repeat it back.";
pub const DEFAULT_ERROR_TEXT: &str = "Sorry, something went wrong. Please try again.";

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Bot identity and secrets. Usually supplied through the environment instead.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Inbound token validation and outbound token endpoints.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Outbound delivery to the messaging backend.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Fixed texts the bot sends.
    #[serde(default)]
    pub bot: BotConfig,
}

/// Bind address, port, and per-turn limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address (default "0.0.0.0"). Overridden by HOST env.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for HTTP (default 8000). Overridden by PORT env.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for one inbound turn, including every outbound send.
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,

    /// Allow unauthenticated (no app id) mode on a non-loopback bind. Only for emulator setups.
    #[serde(default)]
    pub allow_anonymous: bool,
}

/// Raw credential inputs; see [`crate::credentials::resolve_credential`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    pub app_id: Option<String>,
    pub app_password: Option<String>,
    pub managed_identity_client_id: Option<String>,
}

/// Token validation (inbound) and token acquisition (outbound) endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    /// OpenID metadata document listing the channel's signing keys.
    #[serde(rename = "openIdMetadataUrl", default = "default_openid_metadata_url")]
    pub openid_metadata_url: String,

    /// Expected `iss` claim on inbound tokens.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// How long fetched signing keys are trusted before re-reading the metadata.
    #[serde(default = "default_key_refresh_secs")]
    pub key_refresh_secs: u64,

    /// Minimum gap between re-reads triggered by a token naming an unknown `kid`.
    #[serde(default = "default_unknown_kid_cooldown_secs")]
    pub unknown_kid_cooldown_secs: u64,

    /// Shared HS256 secret for channels that sign with a symmetric key. When set it
    /// replaces the OpenID metadata key source.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// OAuth2 token endpoint for the client-secret flow.
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,

    /// Managed identity endpoint. When unset, IDENTITY_ENDPOINT env or the instance metadata service is used.
    #[serde(default)]
    pub identity_endpoint: Option<String>,
}

/// What the relay answers when a reply could not be delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryFailurePolicy {
    /// Answer 200 so the backend does not redeliver the activity.
    #[default]
    Acknowledge,
    /// Answer 502 so the backend may redeliver.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// HTTP timeout for token fetches and activity posts.
    #[serde(default = "default_delivery_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub on_failure: DeliveryFailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    /// Greeting sent to each member who joins a conversation with the bot.
    #[serde(default = "default_welcome_text")]
    pub welcome_text: String,

    /// Apology sent when handling an activity fails.
    #[serde(default = "default_error_text")]
    pub error_text: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_turn_timeout_secs() -> u64 {
    30
}

fn default_openid_metadata_url() -> String {
    "https://login.botframework.com/v1/.well-known/openidconfiguration".to_string()
}

fn default_issuer() -> String {
    "https://api.botframework.com".to_string()
}

fn default_key_refresh_secs() -> u64 {
    24 * 60 * 60
}

fn default_unknown_kid_cooldown_secs() -> u64 {
    5 * 60
}

fn default_token_endpoint() -> String {
    "https://login.microsoftonline.com/botframework.com/oauth2/v2.0/token".to_string()
}

fn default_delivery_timeout_secs() -> u64 {
    15
}

fn default_welcome_text() -> String {
    DEFAULT_WELCOME_TEXT.to_string()
}

fn default_error_text() -> String {
    DEFAULT_ERROR_TEXT.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            turn_timeout_secs: default_turn_timeout_secs(),
            allow_anonymous: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            openid_metadata_url: default_openid_metadata_url(),
            issuer: default_issuer(),
            key_refresh_secs: default_key_refresh_secs(),
            unknown_kid_cooldown_secs: default_unknown_kid_cooldown_secs(),
            signing_secret: None,
            token_endpoint: default_token_endpoint(),
            identity_endpoint: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout_secs(),
            on_failure: DeliveryFailurePolicy::default(),
        }
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            welcome_text: default_welcome_text(),
            error_text: default_error_text(),
        }
    }
}

impl ServerConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs.max(1))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Trim and drop empty strings.
fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Read an environment variable; unset and blank are both treated as absent.
pub fn env_value(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok().as_deref())
}

/// Bot app id (config value; env is layered in by [`apply_env_overrides`]).
pub fn resolve_app_id(config: &Config) -> Option<String> {
    non_empty(config.credentials.app_id.as_deref())
}

pub fn resolve_app_password(config: &Config) -> Option<String> {
    non_empty(config.credentials.app_password.as_deref())
}

pub fn resolve_managed_identity_client_id(config: &Config) -> Option<String> {
    non_empty(config.credentials.managed_identity_client_id.as_deref())
}

/// Layer environment variables over the file config. A variable that is set (even to an
/// empty string) replaces the file value, so `MicrosoftAppPassword=` can switch a deployment
/// to managed identity without editing the file.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    apply_overrides(config, |name| std::env::var(name).ok())
}

fn apply_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
    if let Some(v) = lookup(ENV_APP_ID) {
        config.credentials.app_id = Some(v);
    }
    if let Some(v) = lookup(ENV_APP_PASSWORD) {
        config.credentials.app_password = Some(v);
    }
    if let Some(v) = lookup(ENV_MANAGED_IDENTITY_CLIENT_ID) {
        config.credentials.managed_identity_client_id = Some(v);
    }
    if let Some(host) = non_empty(lookup(ENV_HOST).as_deref()) {
        config.server.host = host;
    }
    if let Some(port) = non_empty(lookup(ENV_PORT).as_deref()) {
        config.server.port = port
            .parse()
            .with_context(|| format!("parsing {}={:?} as a port", ENV_PORT, port))?;
    }
    Ok(())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var(ENV_CONFIG_PATH).map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".echo-bot").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Environment overrides are applied on top.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config)?;
    Ok((config, path))
}
