use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::messages::ErrorPayload;

/// Envelope for all peer-to-peer communication.
///
/// The `payload` field uses `serde_json::value::RawValue` to defer
/// deserialization until the receiver knows which shape to expect.
/// `correlation_id` is present on requests and on their responses/errors,
/// and absent on fire-and-forget notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    /// Creates a new message with the given type, payload and correlation id.
    pub fn new<T: Serialize>(
        msg_type: MessageType,
        payload: Option<&T>,
        correlation_id: Option<String>,
    ) -> Result<Self, serde_json::Error> {
        let raw = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            msg_type,
            payload: raw,
            correlation_id,
        })
    }

    /// Creates a request carrying `correlation_id`.
    pub fn request<T: Serialize>(
        msg_type: MessageType,
        payload: &T,
        correlation_id: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        Message::new(msg_type, Some(payload), Some(correlation_id.into()))
    }

    /// Creates a notification (no correlation id).
    pub fn notification<T: Serialize>(
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Message::new(msg_type, Some(payload), None)
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.payload {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Creates an error message.
    pub fn error(correlation_id: Option<String>, code: i32, message: impl Into<String>) -> Self {
        let payload = ErrorPayload {
            code,
            message: message.into(),
        };
        // ErrorPayload is two plain fields; serializing it cannot fail.
        let raw = serde_json::to_string(&payload)
            .ok()
            .and_then(|json| serde_json::value::RawValue::from_string(json).ok());
        Self {
            msg_type: MessageType::Error,
            payload: raw,
            correlation_id,
        }
    }

    /// Creates a response message for this request.
    pub fn reply<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Message::new(msg_type, Some(payload), self.correlation_id.clone())
    }

    /// Creates an error response for this request.
    pub fn reply_error(&self, code: i32, message: impl Into<String>) -> Self {
        Message::error(self.correlation_id.clone(), code, message)
    }

    /// Returns `true` if this is an `ERROR` message.
    pub fn is_error(&self) -> bool {
        self.msg_type == MessageType::Error
    }

    /// Extracts the error details of an `ERROR` message.
    ///
    /// A malformed error payload still yields an error with a generic
    /// message so that it can be surfaced to the caller.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if !self.is_error() {
            return None;
        }
        Some(
            self.parse_payload::<ErrorPayload>()
                .ok()
                .flatten()
                .unwrap_or_else(|| ErrorPayload {
                    code: crate::constants::ERR_CODE_INTERNAL,
                    message: "malformed error payload".into(),
                }),
        )
    }

    /// Serializes the message to a JSON byte buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a message from a JSON byte buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
