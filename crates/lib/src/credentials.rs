//! Credential resolution: pick exactly one authentication strategy from configuration.
//!
//! Resolution happens once at startup; the resulting [`Credential`] is shared read-only
//! for the lifetime of the process.

use crate::config::{self, Config};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential initialization failed: {0}")]
    InitFailed(String),
}

/// The active authentication strategy.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// No app id: inbound requests are not authenticated and outbound calls carry no token.
    /// Intended for a local emulator only.
    Anonymous,
    /// App id plus shared secret (OAuth2 client credentials).
    ClientSecret { app_id: String, app_password: String },
    /// User-assigned managed identity, selected by its client id.
    ManagedIdentity { app_id: String, client_id: String },
    /// The host's own identity (system-assigned managed identity).
    PlatformIdentity { app_id: String },
}

impl Credential {
    /// Bot app id, `None` when anonymous.
    pub fn app_id(&self) -> Option<&str> {
        match self {
            Credential::Anonymous => None,
            Credential::ClientSecret { app_id, .. }
            | Credential::ManagedIdentity { app_id, .. }
            | Credential::PlatformIdentity { app_id } => Some(app_id),
        }
    }

    /// Whether inbound requests must carry a valid bearer token.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Credential::Anonymous)
    }

    /// Short label for logs and diagnostics.
    pub fn auth_method(&self) -> &'static str {
        match self {
            Credential::Anonymous => "anonymous",
            Credential::ClientSecret { .. } => "client-secret",
            Credential::ManagedIdentity { .. } => "managed-identity",
            Credential::PlatformIdentity { .. } => "platform-identity",
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Anonymous => f.write_str("Anonymous"),
            Credential::ClientSecret { app_id, .. } => f
                .debug_struct("ClientSecret")
                .field("app_id", app_id)
                .field("app_password", &"********")
                .finish(),
            Credential::ManagedIdentity { app_id, client_id } => f
                .debug_struct("ManagedIdentity")
                .field("app_id", app_id)
                .field("client_id", client_id)
                .finish(),
            Credential::PlatformIdentity { app_id } => f
                .debug_struct("PlatformIdentity")
                .field("app_id", app_id)
                .finish(),
        }
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Values end up in form bodies and headers; a stray newline or tab from a pasted
/// setting would make every token request fail.
fn check_printable(name: &str, value: Option<&str>) -> Result<(), CredentialError> {
    match value {
        Some(v) if v.chars().any(|c| c.is_control() || c.is_whitespace()) => Err(
            CredentialError::InitFailed(format!("{} contains whitespace or control characters", name)),
        ),
        _ => Ok(()),
    }
}

/// Select the credential variant from the three raw inputs.
///
/// Order: an empty app id means anonymous (the other two inputs are ignored), then a
/// managed identity client id wins, then an empty password means the platform identity,
/// otherwise the client secret.
pub fn resolve_credential(
    app_id: Option<&str>,
    app_password: Option<&str>,
    managed_identity_client_id: Option<&str>,
) -> Result<Credential, CredentialError> {
    let Some(app_id) = present(app_id) else {
        return Ok(Credential::Anonymous);
    };
    let app_password = present(app_password);
    let managed_id = present(managed_identity_client_id);
    check_printable(config::ENV_APP_ID, Some(app_id))?;
    check_printable(config::ENV_APP_PASSWORD, app_password)?;
    check_printable(config::ENV_MANAGED_IDENTITY_CLIENT_ID, managed_id)?;

    let app_id = app_id.to_string();
    if let Some(client_id) = managed_id {
        return Ok(Credential::ManagedIdentity {
            app_id,
            client_id: client_id.to_string(),
        });
    }
    match app_password {
        None => Ok(Credential::PlatformIdentity { app_id }),
        Some(p) => Ok(Credential::ClientSecret {
            app_id,
            app_password: p.to_string(),
        }),
    }
}

/// Resolve the credential from a loaded config (env overrides already applied).
pub fn credential_from_config(config: &Config) -> Result<Credential, CredentialError> {
    let app_password = config::resolve_app_password(config);
    let managed_id = config::resolve_managed_identity_client_id(config);
    let credential = resolve_credential(
        config::resolve_app_id(config).as_deref(),
        app_password.as_deref(),
        managed_id.as_deref(),
    )?;
    if credential == Credential::Anonymous {
        log::warn!(
            "{} is not set: inbound requests will NOT be authenticated (emulator mode)",
            config::ENV_APP_ID
        );
        if present(app_password.as_deref()).is_some() || present(managed_id.as_deref()).is_some() {
            log::warn!(
                "{} and {} are ignored without {}",
                config::ENV_APP_PASSWORD,
                config::ENV_MANAGED_IDENTITY_CLIENT_ID,
                config::ENV_APP_ID
            );
        }
    } else {
        log::info!("using {} authentication", credential.auth_method());
    }
    Ok(credential)
}
