//! Credential diagnostics: report which settings are present, which auth method they
//! select, and whether a token can actually be obtained.

use crate::config::{self, Config};
use crate::credentials::{self, Credential};
use crate::token::{CredentialTokenSource, TokenSource};
use std::fmt::Write as _;
use std::sync::Arc;

/// Outcome of a diagnostics run. `lines` is the human-readable report.
#[derive(Debug, Clone)]
pub struct Diagnosis {
    pub lines: Vec<String>,
    pub healthy: bool,
}

/// First 8 characters of an id followed by `...`; ids are never printed whole.
pub fn mask_id(value: &str) -> String {
    let head: String = value.chars().take(8).collect();
    format!("{}...", head)
}

fn presence(name: &str, value: Option<&str>, show: impl Fn(&str) -> String) -> String {
    match value {
        Some(v) => format!("  {}: set ({})", name, show(v)),
        None => format!("  {}: not set", name),
    }
}

/// Settings section of the report.
pub fn environment_report(config: &Config) -> Vec<String> {
    let app_id = config::resolve_app_id(config);
    let password = config::resolve_app_password(config);
    let managed_id = config::resolve_managed_identity_client_id(config);
    vec![
        "== settings ==".to_string(),
        presence(config::ENV_APP_ID, app_id.as_deref(), mask_id),
        presence(config::ENV_APP_PASSWORD, password.as_deref(), |_| "********".to_string()),
        presence(
            config::ENV_MANAGED_IDENTITY_CLIENT_ID,
            managed_id.as_deref(),
            mask_id,
        ),
    ]
}

/// Setup hints printed when diagnostics fail.
pub fn recommendations() -> Vec<String> {
    [
        "== recommendations ==",
        "1. Hosted with a system-assigned managed identity:",
        "   - enable the identity on the host",
        "   - set MicrosoftAppId only; leave MicrosoftAppPassword unset",
        "2. User-assigned managed identity:",
        "   - set MicrosoftAppId and ManagedIdentityClientId",
        "   - leave MicrosoftAppPassword unset and grant the identity access to the bot registration",
        "3. Development or on-premises:",
        "   - set MicrosoftAppId and MicrosoftAppPassword (a client secret of the bot registration)",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Full run: settings, selected method, one token fetch.
pub async fn run_diagnostics(config: &Config) -> Diagnosis {
    let mut lines = environment_report(config);
    lines.push("== auth method ==".to_string());

    let credential = match credentials::credential_from_config(config) {
        Ok(Credential::Anonymous) => {
            lines.push(format!(
                "  {} is not set: only local emulator testing will work",
                config::ENV_APP_ID
            ));
            if config::resolve_app_password(config).is_some()
                || config::resolve_managed_identity_client_id(config).is_some()
            {
                lines.push(format!(
                    "  {} and {} are ignored until {} is set",
                    config::ENV_APP_PASSWORD,
                    config::ENV_MANAGED_IDENTITY_CLIENT_ID,
                    config::ENV_APP_ID
                ));
            }
            return finish(lines, false);
        }
        Ok(c) => c,
        Err(e) => {
            lines.push(format!("  {}", e));
            return finish(lines, false);
        }
    };
    lines.push(format!("  {}", credential.auth_method()));

    lines.push("== token ==".to_string());
    let client = match reqwest::Client::builder()
        .timeout(config.delivery.timeout())
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            lines.push(format!("  building HTTP client failed: {}", e));
            return finish(lines, false);
        }
    };
    let source = CredentialTokenSource::new(Arc::new(credential), &config.auth, client);
    let healthy = match source.fetch_token().await {
        Ok(Some(token)) => {
            let mut line = String::from("  token acquired");
            if let Some(exp) = token.expires_on {
                let _ = write!(line, ", expires {}", exp.to_rfc3339());
            }
            lines.push(line);
            true
        }
        Ok(None) => {
            lines.push("  no token required".to_string());
            true
        }
        Err(e) => {
            lines.push(format!("  token request failed: {}", e));
            false
        }
    };
    finish(lines, healthy)
}

fn finish(mut lines: Vec<String>, healthy: bool) -> Diagnosis {
    if healthy {
        lines.push("result: authentication settings look good".to_string());
    } else {
        lines.push("result: authentication settings need attention".to_string());
        lines.extend(recommendations());
    }
    Diagnosis { lines, healthy }
}
