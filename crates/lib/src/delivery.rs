//! Outbound delivery: post reply activities to the conversation's service URL.
//!
//! At-most-once: a failed send is reported to the caller and never retried.

use crate::activity::{Activity, ConversationReference, DeliveryReceipt};
use crate::token::{TokenError, TokenSource};
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid service url {0:?}")]
    InvalidServiceUrl(String),
    #[error("acquiring token failed: {0}")]
    Token(#[from] TokenError),
    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend rejected activity: {status} {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Sends one activity into a conversation.
#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn send(
        &self,
        reference: &ConversationReference,
        activity: &Activity,
    ) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Client for the backend's conversation REST API (`/v3/conversations/...`).
pub struct ConnectorClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl ConnectorClient {
    pub fn new(client: reqwest::Client, tokens: Arc<dyn TokenSource>) -> Self {
        Self { client, tokens }
    }

    /// `{serviceUrl}/v3/conversations/{id}/activities[/{replyToId}]`, segments percent-encoded.
    pub fn activities_url(reference: &ConversationReference) -> Result<Url, DeliveryError> {
        let invalid = || DeliveryError::InvalidServiceUrl(reference.service_url.clone());
        let mut url = Url::parse(&reference.service_url).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid());
        }
        {
            let mut segments = url.path_segments_mut().map_err(|_| invalid())?;
            segments.pop_if_empty().extend([
                "v3",
                "conversations",
                reference.conversation_id.as_str(),
                "activities",
            ]);
            if let Some(id) = reference.activity_id.as_deref() {
                segments.push(id);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ActivitySender for ConnectorClient {
    async fn send(
        &self,
        reference: &ConversationReference,
        activity: &Activity,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let url = Self::activities_url(reference)?;
        let token = self.tokens.fetch_token().await?;
        let mut req = self.client.post(url.clone()).json(activity);
        if let Some(token) = token {
            req = req.bearer_auth(token.token);
        }
        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected { status, body });
        }
        // Some channels answer with an empty body.
        let body = res.bytes().await?;
        let receipt = serde_json::from_slice(&body).unwrap_or_default();
        log::debug!("delivered activity to {} ({})", url, status);
        Ok(receipt)
    }
}
