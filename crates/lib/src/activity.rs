//! Activity wire types (the subset of the messaging backend schema this bot reads and writes).

use serde::{Deserialize, Serialize};

/// Activity kind. Unrecognized kinds parse as [`ActivityType::Unknown`] and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityType {
    Message,
    ConversationUpdate,
    Typing,
    Invoke,
    EndOfConversation,
    Event,
    InstallationUpdate,
    MessageReaction,
    #[serde(other)]
    Unknown,
}

/// A user or bot: `{ "id", "name" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAccount {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

/// One unit of conversational exchange. `type` is the only required field on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "type")]
    pub typ: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_added: Vec<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members_removed: Vec<ChannelAccount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl Activity {
    /// Bare activity of the given type with every optional field empty.
    pub fn new(typ: ActivityType) -> Self {
        Self {
            typ,
            id: None,
            timestamp: None,
            channel_id: None,
            service_url: None,
            from: None,
            recipient: None,
            conversation: None,
            text: None,
            text_format: None,
            locale: None,
            reply_to_id: None,
            members_added: Vec::new(),
            members_removed: Vec::new(),
            value: None,
        }
    }

    /// Text message addressed back into the conversation `inbound` came from.
    /// Sender and recipient are swapped; the id is left for the backend to assign.
    pub fn reply_from(inbound: &Activity, text: impl Into<String>) -> Self {
        Self {
            channel_id: inbound.channel_id.clone(),
            service_url: inbound.service_url.clone(),
            from: inbound.recipient.clone(),
            recipient: inbound.from.clone(),
            conversation: inbound.conversation.clone(),
            text: Some(text.into()),
            text_format: Some("plain".to_string()),
            locale: inbound.locale.clone(),
            reply_to_id: inbound.id.clone(),
            ..Self::new(ActivityType::Message)
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation.as_ref().map(|c| c.id.as_str())
    }

    /// Short description for log lines: `message id=... conversation=...`.
    pub fn summary(&self) -> String {
        format!(
            "{:?} id={} conversation={}",
            self.typ,
            self.id.as_deref().unwrap_or("-"),
            self.conversation_id().unwrap_or("-")
        )
    }
}

/// Where replies for a turn are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationReference {
    pub service_url: String,
    pub conversation_id: String,
    /// Inbound activity id; replies are threaded under it when present.
    pub activity_id: Option<String>,
}

impl ConversationReference {
    /// `None` when the activity lacks a service URL or conversation.
    pub fn from_activity(activity: &Activity) -> Option<Self> {
        let service_url = activity
            .service_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        let conversation_id = activity.conversation_id().filter(|s| !s.is_empty())?;
        Some(Self {
            service_url: service_url.to_string(),
            conversation_id: conversation_id.to_string(),
            activity_id: activity.id.clone().filter(|s| !s.is_empty()),
        })
    }
}

/// Backend answer to a posted activity (`ResourceResponse`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    #[serde(default)]
    pub id: Option<String>,
}

/// Synchronous answer to an `invoke` activity, returned in the HTTP response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_json() -> serde_json::Value {
        json!({
            "type": "message",
            "id": "a1",
            "channelId": "msteams",
            "serviceUrl": "https://smba.example.net/",
            "from": { "id": "u1", "name": "User" },
            "recipient": { "id": "bot1", "name": "Bot" },
            "conversation": { "id": "c1", "isGroup": false },
            "text": "hello",
            "entities": [{ "type": "clientInfo" }]
        })
    }

    #[test]
    fn parses_message_and_ignores_unknown_fields() {
        let a: Activity = serde_json::from_value(message_json()).unwrap();
        assert_eq!(a.typ, ActivityType::Message);
        assert_eq!(a.text.as_deref(), Some("hello"));
        assert_eq!(a.from.as_ref().map(|f| f.id.as_str()), Some("u1"));
        assert_eq!(a.conversation_id(), Some("c1"));
        assert!(a.members_added.is_empty());
    }

    #[test]
    fn missing_type_is_rejected() {
        let r: Result<Activity, _> = serde_json::from_value(json!({ "text": "hi" }));
        assert!(r.is_err());
    }

    #[test]
    fn unknown_type_parses_as_unknown() {
        let a: Activity = serde_json::from_value(json!({ "type": "suggestion" })).unwrap();
        assert_eq!(a.typ, ActivityType::Unknown);
    }

    #[test]
    fn reply_swaps_accounts_and_keeps_conversation() {
        let inbound: Activity = serde_json::from_value(message_json()).unwrap();
        let reply = Activity::reply_from(&inbound, "Echo: hello");
        assert_eq!(reply.typ, ActivityType::Message);
        assert_eq!(reply.id, None);
        assert_eq!(reply.from.as_ref().map(|f| f.id.as_str()), Some("bot1"));
        assert_eq!(reply.recipient.as_ref().map(|r| r.id.as_str()), Some("u1"));
        assert_eq!(reply.conversation_id(), Some("c1"));
        assert_eq!(reply.reply_to_id.as_deref(), Some("a1"));

        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire["type"], "message");
        assert_eq!(wire["conversation"]["id"], "c1");
        assert!(wire.get("id").is_none());
        assert!(wire.get("membersAdded").is_none());
    }

    #[test]
    fn conversation_reference_requires_service_url_and_conversation() {
        let inbound: Activity = serde_json::from_value(message_json()).unwrap();
        let r = ConversationReference::from_activity(&inbound).unwrap();
        assert_eq!(r.service_url, "https://smba.example.net/");
        assert_eq!(r.conversation_id, "c1");
        assert_eq!(r.activity_id.as_deref(), Some("a1"));

        let mut no_url = inbound.clone();
        no_url.service_url = None;
        assert!(ConversationReference::from_activity(&no_url).is_none());
    }
}
