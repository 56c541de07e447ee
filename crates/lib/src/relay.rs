//! Inbound relay: parse, authenticate, run the bot, deliver its replies.
//!
//! One call to [`Relay::process`] is one turn. It returns only after every send of the
//! turn has finished or one has failed.

use crate::activity::{Activity, ConversationReference, DeliveryReceipt, InvokeResponse};
use crate::auth::{AuthError, RequestAuthenticator};
use crate::bot::{ActivityHandler, BotError};
use crate::config::{Config, DeliveryFailurePolicy};
use crate::delivery::{ActivitySender, DeliveryError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
    /// The signing keys could not be read, so no token can be checked.
    #[error("cannot verify requests: {0}")]
    AuthUnavailable(AuthError),
    #[error("delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),
    #[error("turn did not finish within {0:?}")]
    TimedOut(Duration),
}

/// What a finished turn produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    /// Receipts of the sends that succeeded, in order.
    pub receipts: Vec<DeliveryReceipt>,
    /// Present when the handler answered an invoke synchronously.
    pub invoke_response: Option<InvokeResponse>,
    /// A send failed and the failure was acknowledged rather than surfaced.
    pub delivery_failed: bool,
}

/// Relay knobs taken from [`Config`].
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub error_text: String,
    pub on_delivery_failure: DeliveryFailurePolicy,
    pub turn_timeout: Duration,
}

impl RelayOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            error_text: config.bot.error_text.clone(),
            on_delivery_failure: config.delivery.on_failure,
            turn_timeout: config.server.turn_timeout(),
        }
    }
}

/// Per-request binding of one inbound activity to the channel its replies go to.
pub struct TurnContext<'a> {
    pub activity: Activity,
    reference: Option<ConversationReference>,
    sender: &'a dyn ActivitySender,
    receipts: Vec<DeliveryReceipt>,
}

impl<'a> TurnContext<'a> {
    pub fn new(activity: Activity, sender: &'a dyn ActivitySender) -> Self {
        let reference = ConversationReference::from_activity(&activity);
        Self {
            activity,
            reference,
            sender,
            receipts: Vec::new(),
        }
    }

    pub fn reference(&self) -> Option<&ConversationReference> {
        self.reference.as_ref()
    }

    /// Deliver one activity into this turn's conversation.
    pub async fn send_activity(&mut self, activity: &Activity) -> Result<DeliveryReceipt, RelayError> {
        let reference = self.reference.as_ref().ok_or_else(|| {
            RelayError::MalformedPayload(
                "activity has no serviceUrl or conversation to reply to".to_string(),
            )
        })?;
        let receipt = self.sender.send(reference, activity).await?;
        self.receipts.push(receipt.clone());
        Ok(receipt)
    }

    fn finish(self, invoke_response: Option<InvokeResponse>, delivery_failed: bool) -> TurnOutcome {
        TurnOutcome {
            receipts: self.receipts,
            invoke_response,
            delivery_failed,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {}", detail)
}

/// The `/api/messages` pipeline.
pub struct Relay {
    authenticator: Arc<dyn RequestAuthenticator>,
    handler: Arc<dyn ActivityHandler>,
    sender: Arc<dyn ActivitySender>,
    options: RelayOptions,
}

impl Relay {
    pub fn new(
        authenticator: Arc<dyn RequestAuthenticator>,
        handler: Arc<dyn ActivityHandler>,
        sender: Arc<dyn ActivitySender>,
        options: RelayOptions,
    ) -> Self {
        Self {
            authenticator,
            handler,
            sender,
            options,
        }
    }

    /// Run one turn for a raw request body, bounded by the configured turn timeout.
    pub async fn process(
        &self,
        auth_header: Option<&str>,
        body: &[u8],
    ) -> Result<TurnOutcome, RelayError> {
        let timeout = self.options.turn_timeout;
        match tokio::time::timeout(timeout, self.run_turn(auth_header, body)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("turn timed out after {:?}", timeout);
                Err(RelayError::TimedOut(timeout))
            }
        }
    }

    async fn run_turn(
        &self,
        auth_header: Option<&str>,
        body: &[u8],
    ) -> Result<TurnOutcome, RelayError> {
        let activity: Activity = serde_json::from_slice(body).map_err(|e| {
            log::debug!("rejecting body: {}", String::from_utf8_lossy(body));
            RelayError::MalformedPayload(e.to_string())
        })?;
        if let Err(e) = self.authenticator.authenticate(auth_header, &activity).await {
            if matches!(e, AuthError::KeyFetch(_)) {
                log::error!("cannot authenticate {}: {}", activity.summary(), e);
                return Err(RelayError::AuthUnavailable(e));
            }
            log::warn!(
                "rejecting {} (authorization header {}): {}",
                activity.summary(),
                if auth_header.is_some() { "present" } else { "absent" },
                e
            );
            return Err(e.into());
        }
        log::debug!("turn started: {}", activity.summary());

        let mut ctx = TurnContext::new(activity, self.sender.as_ref());
        let handled = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&ctx.activity)))
            .unwrap_or_else(|payload| Err(BotError::Logic(panic_message(payload.as_ref()))));
        let output = match handled {
            Ok(output) => output,
            Err(e) => {
                log::error!("turn failed for {}: {}", ctx.activity.summary(), e);
                self.notify_error(&mut ctx).await;
                return Ok(ctx.finish(None, false));
            }
        };

        if !output.replies.is_empty() && ctx.reference().is_none() {
            return Err(RelayError::MalformedPayload(
                "activity has no serviceUrl or conversation to reply to".to_string(),
            ));
        }
        for reply in &output.replies {
            if let Err(e) = ctx.send_activity(reply).await {
                log::warn!("delivery failed for {}: {}", ctx.activity.summary(), e);
                return match self.options.on_delivery_failure {
                    DeliveryFailurePolicy::Acknowledge => Ok(ctx.finish(output.invoke_response, true)),
                    DeliveryFailurePolicy::Reject => Err(e),
                };
            }
        }
        Ok(ctx.finish(output.invoke_response, false))
    }

    /// Best-effort apology after a handler failure. A failure here is logged only.
    async fn notify_error(&self, ctx: &mut TurnContext<'_>) {
        let apology = Activity::reply_from(&ctx.activity, self.options.error_text.clone());
        if let Err(e) = ctx.send_activity(&apology).await {
            log::error!(
                "sending error notification for {} failed: {}",
                ctx.activity.summary(),
                e
            );
        }
    }
}
