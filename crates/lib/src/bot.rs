//! Bot logic: turn an inbound activity into the replies to send.
//!
//! Handlers are pure: they never perform I/O. The relay delivers whatever they return.

use crate::activity::{Activity, ActivityType, ChannelAccount, InvokeResponse};
use crate::config::BotConfig;

/// Prefix of every echoed message.
pub const ECHO_PREFIX: &str = "Echo: ";

#[derive(Debug, thiserror::Error)]
pub enum BotError {
    #[error("bot logic failed: {0}")]
    Logic(String),
}

/// Result of one turn: activities to deliver plus an optional synchronous invoke answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub replies: Vec<Activity>,
    pub invoke_response: Option<InvokeResponse>,
}

impl TurnOutput {
    pub fn replies(replies: Vec<Activity>) -> Self {
        Self {
            replies,
            invoke_response: None,
        }
    }
}

/// Handles one inbound activity.
pub trait ActivityHandler: Send + Sync {
    fn handle(&self, activity: &Activity) -> Result<TurnOutput, BotError>;
}

/// Echoes messages and greets members who join.
pub struct EchoBot {
    welcome_text: String,
    /// Used as the bot id when an activity has no recipient.
    app_id: Option<String>,
}

impl EchoBot {
    pub fn new(config: &BotConfig, app_id: Option<String>) -> Self {
        Self {
            welcome_text: config.welcome_text.clone(),
            app_id,
        }
    }

    /// One reply `"Echo: " + text` for a non-empty message; nothing otherwise.
    pub fn on_message(&self, activity: &Activity) -> Vec<Activity> {
        match activity.text.as_deref() {
            Some(text) if !text.is_empty() => {
                vec![Activity::reply_from(activity, format!("{}{}", ECHO_PREFIX, text))]
            }
            _ => Vec::new(),
        }
    }

    /// One greeting per added member, except the bot itself.
    pub fn on_members_added(
        &self,
        members: &[ChannelAccount],
        activity: &Activity,
    ) -> Vec<Activity> {
        let bot_id = activity
            .recipient
            .as_ref()
            .map(|r| r.id.as_str())
            .or(self.app_id.as_deref());
        members
            .iter()
            .filter(|m| Some(m.id.as_str()) != bot_id)
            .map(|_| Activity::reply_from(activity, self.welcome_text.clone()))
            .collect()
    }
}

impl ActivityHandler for EchoBot {
    fn handle(&self, activity: &Activity) -> Result<TurnOutput, BotError> {
        let replies = match activity.typ {
            ActivityType::Message => self.on_message(activity),
            ActivityType::ConversationUpdate => {
                self.on_members_added(&activity.members_added, activity)
            }
            other => {
                log::debug!("ignoring {:?} activity", other);
                Vec::new()
            }
        };
        Ok(TurnOutput::replies(replies))
    }
}
