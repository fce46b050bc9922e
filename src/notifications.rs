//! Notification envelopes pushed to API subscribers.
//!
//! Every event maps through [`Kind`] to an optional top-level envelope
//! and an optional `type` string. Events without an envelope serialize
//! unwrapped.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::Result;

/// SHA2-256 multihash code and digest length.
const MULTIHASH_PREFIX: [u8; 2] = [0x12, 0x20];

/// Base58 multihash over 32 random bytes.
pub fn new_id() -> String {
    let mut buf = [0u8; 34];
    buf[..2].copy_from_slice(&MULTIHASH_PREFIX);
    rand::thread_rng().fill_bytes(&mut buf[2..]);
    bs58::encode(buf).into_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Notification,
    Message,
    MessageRead,
    MessageTyping,
    Wallet,
}

impl Envelope {
    pub fn key(self) -> &'static str {
        match self {
            Envelope::Notification => "notification",
            Envelope::Message => "message",
            Envelope::MessageRead => "messageRead",
            Envelope::MessageTyping => "messageTyping",
            Envelope::Wallet => "wallet",
        }
    }

    fn from_key(key: &str) -> Option<Self> {
        [Self::Notification, Self::Message, Self::MessageRead, Self::MessageTyping, Self::Wallet]
            .into_iter()
            .find(|e| e.key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Order,
    Payment,
    OrderConfirmation,
    OrderDeclined,
    OrderCancel,
    Refund,
    Fulfillment,
    Completion,
    DisputeOpen,
    DisputeUpdate,
    DisputeClose,
    DisputeAccepted,
    Follow,
    Unfollow,
    ModeratorAdd,
    ModeratorRemove,
    ChatMessage,
    ChatRead,
    ChatTyping,
    IncomingTransaction,
    Status,
    Test,
}

impl Kind {
    pub const ALL: [Kind; 22] = [
        Kind::Order,
        Kind::Payment,
        Kind::OrderConfirmation,
        Kind::OrderDeclined,
        Kind::OrderCancel,
        Kind::Refund,
        Kind::Fulfillment,
        Kind::Completion,
        Kind::DisputeOpen,
        Kind::DisputeUpdate,
        Kind::DisputeClose,
        Kind::DisputeAccepted,
        Kind::Follow,
        Kind::Unfollow,
        Kind::ModeratorAdd,
        Kind::ModeratorRemove,
        Kind::ChatMessage,
        Kind::ChatRead,
        Kind::ChatTyping,
        Kind::IncomingTransaction,
        Kind::Status,
        Kind::Test,
    ];

    /// Envelope and `type` string for this kind.
    pub const fn table(self) -> (Option<Envelope>, Option<&'static str>) {
        match self {
            Kind::Order => (Some(Envelope::Notification), Some("order")),
            Kind::Payment => (Some(Envelope::Notification), Some("payment")),
            Kind::OrderConfirmation => (Some(Envelope::Notification), Some("orderConfirmation")),
            Kind::OrderDeclined => (None, Some("orderDeclined")),
            Kind::OrderCancel => (Some(Envelope::Notification), Some("cancel")),
            Kind::Refund => (Some(Envelope::Notification), Some("refund")),
            Kind::Fulfillment => (Some(Envelope::Notification), Some("fulfillment")),
            Kind::Completion => (Some(Envelope::Notification), Some("orderComplete")),
            Kind::DisputeOpen => (Some(Envelope::Notification), Some("disputeOpen")),
            Kind::DisputeUpdate => (Some(Envelope::Notification), Some("disputeUpdate")),
            Kind::DisputeClose => (Some(Envelope::Notification), Some("disputeClose")),
            Kind::DisputeAccepted => (Some(Envelope::Notification), Some("disputeAccepted")),
            Kind::Follow => (Some(Envelope::Notification), Some("follow")),
            Kind::Unfollow => (Some(Envelope::Notification), Some("unfollow")),
            Kind::ModeratorAdd => (Some(Envelope::Notification), Some("moderatorAdd")),
            Kind::ModeratorRemove => (Some(Envelope::Notification), Some("moderatorRemove")),
            Kind::ChatMessage => (Some(Envelope::Message), None),
            Kind::ChatRead => (Some(Envelope::MessageRead), None),
            Kind::ChatTyping => (Some(Envelope::MessageTyping), None),
            Kind::IncomingTransaction => (Some(Envelope::Wallet), None),
            Kind::Status => (None, None),
            Kind::Test => (None, None),
        }
    }

    pub fn envelope(self) -> Option<Envelope> {
        self.table().0
    }

    pub fn type_str(self) -> Option<&'static str> {
        self.table().1
    }

    fn lookup(envelope: Option<Envelope>, type_str: Option<&str>) -> Option<Kind> {
        Self::ALL.into_iter().find(|k| k.envelope() == envelope && k.type_str() == type_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub tiny: String,
    pub small: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub notification_id: String,
    pub title: String,
    pub buyer_id: String,
    pub buyer_handle: String,
    pub thumbnail: Thumbnail,
    pub order_id: String,
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentNotification {
    pub notification_id: String,
    pub order_id: String,
    pub funding_total: u64,
}

/// Order events raised by the vendor: confirmation, decline, refund and
/// fulfillment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorNotification {
    pub notification_id: String,
    pub order_id: String,
    pub thumbnail: Thumbnail,
    pub vendor_handle: String,
    pub vendor_id: String,
}

/// Order events raised by the buyer: cancel and completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerNotification {
    pub notification_id: String,
    pub order_id: String,
    pub thumbnail: Thumbnail,
    pub buyer_handle: String,
    pub buyer_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeNotification {
    pub notification_id: String,
    pub order_id: String,
    pub thumbnail: Thumbnail,
    pub disputer_id: String,
    pub disputer_handle: String,
    pub disputee_id: String,
    pub disputee_handle: String,
    pub buyer: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeResolvedNotification {
    pub notification_id: String,
    pub order_id: String,
    pub thumbnail: Thumbnail,
    pub other_party_id: String,
    pub other_party_handle: String,
    pub buyer: String,
}

/// Follow, unfollow and moderator changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerNotification {
    pub notification_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    pub peer_id: String,
    pub subject: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRead {
    pub message_id: String,
    pub peer_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTyping {
    pub peer_id: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingTransaction {
    pub txid: String,
    pub value: i64,
    pub address: String,
    pub status: String,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
    pub confirmations: i32,
    pub order_id: String,
    pub thumbnail: String,
    pub height: i32,
    pub can_bump_fee: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotification {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestNotification {}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Order(OrderNotification),
    Payment(PaymentNotification),
    OrderConfirmation(VendorNotification),
    OrderDeclined(VendorNotification),
    OrderCancel(BuyerNotification),
    Refund(VendorNotification),
    Fulfillment(VendorNotification),
    Completion(BuyerNotification),
    DisputeOpen(DisputeNotification),
    DisputeUpdate(DisputeNotification),
    DisputeClose(DisputeResolvedNotification),
    DisputeAccepted(DisputeResolvedNotification),
    Follow(PeerNotification),
    Unfollow(PeerNotification),
    ModeratorAdd(PeerNotification),
    ModeratorRemove(PeerNotification),
    ChatMessage(ChatMessage),
    ChatRead(ChatRead),
    ChatTyping(ChatTyping),
    IncomingTransaction(IncomingTransaction),
    Status(StatusNotification),
    Test(TestNotification),
}

impl Notification {
    pub fn kind(&self) -> Kind {
        match self {
            Notification::Order(_) => Kind::Order,
            Notification::Payment(_) => Kind::Payment,
            Notification::OrderConfirmation(_) => Kind::OrderConfirmation,
            Notification::OrderDeclined(_) => Kind::OrderDeclined,
            Notification::OrderCancel(_) => Kind::OrderCancel,
            Notification::Refund(_) => Kind::Refund,
            Notification::Fulfillment(_) => Kind::Fulfillment,
            Notification::Completion(_) => Kind::Completion,
            Notification::DisputeOpen(_) => Kind::DisputeOpen,
            Notification::DisputeUpdate(_) => Kind::DisputeUpdate,
            Notification::DisputeClose(_) => Kind::DisputeClose,
            Notification::DisputeAccepted(_) => Kind::DisputeAccepted,
            Notification::Follow(_) => Kind::Follow,
            Notification::Unfollow(_) => Kind::Unfollow,
            Notification::ModeratorAdd(_) => Kind::ModeratorAdd,
            Notification::ModeratorRemove(_) => Kind::ModeratorRemove,
            Notification::ChatMessage(_) => Kind::ChatMessage,
            Notification::ChatRead(_) => Kind::ChatRead,
            Notification::ChatTyping(_) => Kind::ChatTyping,
            Notification::IncomingTransaction(_) => Kind::IncomingTransaction,
            Notification::Status(_) => Kind::Status,
            Notification::Test(_) => Kind::Test,
        }
    }

    pub fn envelope(&self) -> Option<Envelope> {
        self.kind().envelope()
    }

    /// Pretty JSON with four-space indentation.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        Ok(buf)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn body(&self) -> serde_json::Result<Value> {
        match self {
            Notification::Order(n) => serde_json::to_value(n),
            Notification::Payment(n) => serde_json::to_value(n),
            Notification::OrderConfirmation(n)
            | Notification::OrderDeclined(n)
            | Notification::Refund(n)
            | Notification::Fulfillment(n) => serde_json::to_value(n),
            Notification::OrderCancel(n) | Notification::Completion(n) => serde_json::to_value(n),
            Notification::DisputeOpen(n) | Notification::DisputeUpdate(n) => serde_json::to_value(n),
            Notification::DisputeClose(n) | Notification::DisputeAccepted(n) => serde_json::to_value(n),
            Notification::Follow(n)
            | Notification::Unfollow(n)
            | Notification::ModeratorAdd(n)
            | Notification::ModeratorRemove(n) => serde_json::to_value(n),
            Notification::ChatMessage(n) => serde_json::to_value(n),
            Notification::ChatRead(n) => serde_json::to_value(n),
            Notification::ChatTyping(n) => serde_json::to_value(n),
            Notification::IncomingTransaction(n) => serde_json::to_value(n),
            Notification::Status(n) => serde_json::to_value(n),
            Notification::Test(n) => serde_json::to_value(n),
        }
    }

    fn from_body(kind: Kind, body: Value) -> serde_json::Result<Self> {
        fn de<T: DeserializeOwned>(v: Value) -> serde_json::Result<T> {
            serde_json::from_value(v)
        }
        Ok(match kind {
            Kind::Order => Notification::Order(de(body)?),
            Kind::Payment => Notification::Payment(de(body)?),
            Kind::OrderConfirmation => Notification::OrderConfirmation(de(body)?),
            Kind::OrderDeclined => Notification::OrderDeclined(de(body)?),
            Kind::OrderCancel => Notification::OrderCancel(de(body)?),
            Kind::Refund => Notification::Refund(de(body)?),
            Kind::Fulfillment => Notification::Fulfillment(de(body)?),
            Kind::Completion => Notification::Completion(de(body)?),
            Kind::DisputeOpen => Notification::DisputeOpen(de(body)?),
            Kind::DisputeUpdate => Notification::DisputeUpdate(de(body)?),
            Kind::DisputeClose => Notification::DisputeClose(de(body)?),
            Kind::DisputeAccepted => Notification::DisputeAccepted(de(body)?),
            Kind::Follow => Notification::Follow(de(body)?),
            Kind::Unfollow => Notification::Unfollow(de(body)?),
            Kind::ModeratorAdd => Notification::ModeratorAdd(de(body)?),
            Kind::ModeratorRemove => Notification::ModeratorRemove(de(body)?),
            Kind::ChatMessage => Notification::ChatMessage(de(body)?),
            Kind::ChatRead => Notification::ChatRead(de(body)?),
            Kind::ChatTyping => Notification::ChatTyping(de(body)?),
            Kind::IncomingTransaction => Notification::IncomingTransaction(de(body)?),
            Kind::Status => Notification::Status(de(body)?),
            Kind::Test => Notification::Test(de(body)?),
        })
    }

    fn wrap(&self) -> std::result::Result<Value, String> {
        let (envelope, type_str) = self.kind().table();
        let mut body = self.body().map_err(|e| e.to_string())?;
        if let Some(t) = type_str {
            let obj = body.as_object_mut().ok_or("notification body is not an object")?;
            obj.insert("type".into(), Value::String(t.into()));
        }
        Ok(match envelope {
            Some(env) => {
                let mut outer = Map::new();
                outer.insert(env.key().into(), body);
                Value::Object(outer)
            }
            None => body,
        })
    }

    fn unwrap_value(value: Value) -> std::result::Result<Self, String> {
        let Value::Object(mut obj) = value else {
            return Err("notification is not a JSON object".into());
        };

        let enveloped = match obj.iter().next() {
            Some((key, Value::Object(_))) if obj.len() == 1 => Envelope::from_key(key),
            _ => None,
        };
        if let Some(env) = enveloped {
            let Some(Value::Object(mut body)) = obj.remove(env.key()) else {
                return Err(format!("empty {} envelope", env.key()));
            };
            let type_str = match env {
                Envelope::Notification => match body.remove("type") {
                    Some(Value::String(t)) => Some(t),
                    _ => return Err("notification without a type".into()),
                },
                _ => None,
            };
            let kind = Kind::lookup(Some(env), type_str.as_deref())
                .ok_or_else(|| format!("unknown {} type {:?}", env.key(), type_str))?;
            return Self::from_body(kind, Value::Object(body)).map_err(|e| e.to_string());
        }

        let kind = match obj.remove("type") {
            Some(Value::String(t)) => {
                Kind::lookup(None, Some(&t)).ok_or_else(|| format!("unknown notification type {:?}", t))?
            }
            Some(_) => return Err("notification type is not a string".into()),
            None if obj.contains_key("status") => Kind::Status,
            None if obj.is_empty() => Kind::Test,
            None => return Err("unrecognised notification".into()),
        };
        Self::from_body(kind, Value::Object(obj)).map_err(|e| e.to_string())
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.wrap().map_err(S::Error::custom)?.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Notification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::unwrap_value(value).map_err(D::Error::custom)
    }
}

/// A notification as stored for the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub notification: Notification,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl NotificationRecord {
    pub fn new(notification: Notification) -> Self {
        Self { notification, timestamp: Utc::now(), read: false }
    }
}
