//! Wire envelope for `/openbazaar/app/1.0.0`.

/// One framed protocol message. Requests carry a fresh non-zero
/// `request_id`; the reply echoes it with `is_response` set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub message_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
    #[prost(bool, tag = "4")]
    pub is_response: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Ping = 0,
    Chat = 1,
    Follow = 2,
    Unfollow = 3,
    Order = 4,
    OrderReject = 5,
    OrderCancel = 6,
    OrderConfirmation = 7,
    OrderFulfillment = 8,
    OrderCompletion = 9,
    DisputeOpen = 10,
    DisputeUpdate = 11,
    DisputeClose = 12,
    Refund = 13,
    OfflineAck = 14,
    OfflineRelay = 15,
    ModeratorAdd = 16,
    ModeratorRemove = 17,
    Store = 18,
    Block = 19,
    VendorFinalizedPayment = 20,
    Error = 500,
}

impl Message {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self { message_type: message_type as i32, payload, request_id: 0, is_response: false }
    }

    /// Reply to `request`, echoing its id.
    pub fn reply_to(request: &Message, message_type: MessageType, payload: Vec<u8>) -> Self {
        Self { message_type: message_type as i32, payload, request_id: request.request_id, is_response: true }
    }

    /// The declared type, or `None` for values this build does not know.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }
}
