use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const TRANSPORT_METHOD: &str = "websocket";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionWelcome,
    SessionKeepalive,
    SessionReconnect,
    Notification,
    Revocation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub message_timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEnvelope {
    metadata: Metadata,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
    #[serde(default)]
    pub connected_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: SessionInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notification {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
    subscription: SubscriptionInfo,
}

#[derive(Debug, Clone)]
pub enum InboundMessage {
    Welcome(SessionInfo),
    Keepalive,
    Reconnect(SessionInfo),
    Notification(Notification),
    Revocation(SubscriptionInfo),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub metadata: Metadata,
    pub message: InboundMessage,
}

impl Envelope {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        let payload = raw.payload;
        let message = match raw.metadata.message_type {
            MessageType::SessionWelcome => {
                InboundMessage::Welcome(serde_json::from_value::<SessionPayload>(payload)?.session)
            }
            MessageType::SessionKeepalive => InboundMessage::Keepalive,
            MessageType::SessionReconnect => {
                InboundMessage::Reconnect(serde_json::from_value::<SessionPayload>(payload)?.session)
            }
            MessageType::Notification => {
                InboundMessage::Notification(serde_json::from_value(payload)?)
            }
            MessageType::Revocation => InboundMessage::Revocation(
                serde_json::from_value::<RevocationPayload>(payload)?.subscription,
            ),
        };
        Ok(Self {
            metadata: raw.metadata,
            message,
        })
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {kind} event body: {source}")]
    Event {
        kind: EventKind,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "channel.channel_points_custom_reward_redemption.add")]
    ChannelPointsRedemption,
    #[serde(rename = "channel.chat.message")]
    ChatMessage,
    #[serde(rename = "channel.subscribe")]
    Subscribe,
    #[serde(rename = "channel.subscription.gift")]
    SubscriptionGift,
    #[serde(rename = "channel.subscription.message")]
    SubscriptionMessage,
    #[serde(rename = "channel.cheer")]
    Cheer,
    #[serde(rename = "stream.online")]
    StreamOnline,
    #[serde(rename = "stream.offline")]
    StreamOffline,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ChannelPointsRedemption,
        EventKind::ChatMessage,
        EventKind::Subscribe,
        EventKind::SubscriptionGift,
        EventKind::SubscriptionMessage,
        EventKind::Cheer,
        EventKind::StreamOnline,
        EventKind::StreamOffline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChannelPointsRedemption => "channel.channel_points_custom_reward_redemption.add",
            Self::ChatMessage => "channel.chat.message",
            Self::Subscribe => "channel.subscribe",
            Self::SubscriptionGift => "channel.subscription.gift",
            Self::SubscriptionMessage => "channel.subscription.message",
            Self::Cheer => "channel.cheer",
            Self::StreamOnline => "stream.online",
            Self::StreamOffline => "stream.offline",
        }
    }

    pub fn version(self) -> &'static str {
        "1"
    }

    // Chat subscriptions must also name the reading user; the bridge reads as the broadcaster.
    pub fn condition(self, broadcaster_id: &str) -> Condition {
        let user_id = match self {
            Self::ChatMessage => Some(broadcaster_id.to_string()),
            _ => None,
        };
        Condition {
            broadcaster_user_id: Some(broadcaster_id.to_string()),
            user_id,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Reward {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardRedemption {
    pub user_name: String,
    #[serde(default)]
    pub user_input: String,
    pub reward: Reward,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatText {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub chatter_user_name: String,
    pub message: ChatText,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Subscribe {
    pub user_name: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub is_gift: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionGift {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub total: u32,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionMessage {
    pub user_name: String,
    #[serde(default)]
    pub cumulative_months: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Cheer {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub bits: u32,
    #[serde(default)]
    pub is_anonymous: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStatus {
    pub broadcaster_user_name: String,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    RewardRedemption(RewardRedemption),
    ChatMessage(ChatMessage),
    Subscribe(Subscribe),
    SubscriptionGift(SubscriptionGift),
    SubscriptionMessage(SubscriptionMessage),
    Cheer(Cheer),
    StreamOnline(StreamStatus),
    StreamOffline(StreamStatus),
}

impl NotificationEvent {
    pub fn decode(kind: EventKind, event: serde_json::Value) -> Result<Self, DecodeError> {
        let wrap = |source| DecodeError::Event { kind, source };
        let decoded = match kind {
            EventKind::ChannelPointsRedemption => {
                Self::RewardRedemption(serde_json::from_value(event).map_err(wrap)?)
            }
            EventKind::ChatMessage => Self::ChatMessage(serde_json::from_value(event).map_err(wrap)?),
            EventKind::Subscribe => Self::Subscribe(serde_json::from_value(event).map_err(wrap)?),
            EventKind::SubscriptionGift => {
                Self::SubscriptionGift(serde_json::from_value(event).map_err(wrap)?)
            }
            EventKind::SubscriptionMessage => {
                Self::SubscriptionMessage(serde_json::from_value(event).map_err(wrap)?)
            }
            EventKind::Cheer => Self::Cheer(serde_json::from_value(event).map_err(wrap)?),
            EventKind::StreamOnline => Self::StreamOnline(serde_json::from_value(event).map_err(wrap)?),
            EventKind::StreamOffline => {
                Self::StreamOffline(serde_json::from_value(event).map_err(wrap)?)
            }
        };
        Ok(decoded)
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::RewardRedemption(_) => EventKind::ChannelPointsRedemption,
            Self::ChatMessage(_) => EventKind::ChatMessage,
            Self::Subscribe(_) => EventKind::Subscribe,
            Self::SubscriptionGift(_) => EventKind::SubscriptionGift,
            Self::SubscriptionMessage(_) => EventKind::SubscriptionMessage,
            Self::Cheer(_) => EventKind::Cheer,
            Self::StreamOnline(_) => EventKind::StreamOnline,
            Self::StreamOffline(_) => EventKind::StreamOffline,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcaster_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    pub method: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub version: String,
    pub condition: Condition,
    pub transport: Transport,
}

impl SubscriptionRequest {
    pub fn new(kind: EventKind, broadcaster_id: &str, session_id: &str) -> Self {
        Self {
            kind,
            version: kind.version().to_string(),
            condition: kind.condition(broadcaster_id),
            transport: Transport {
                method: TRANSPORT_METHOD.to_string(),
                session_id: session_id.to_string(),
            },
        }
    }
}
