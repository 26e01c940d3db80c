//! Typed message bodies.
//!
//! [`Body`] is the tagged union of every payload shape, keyed by
//! [`MessageType`]. Dispatchers decode an envelope once and then match
//! exhaustively on the variant instead of poking at untyped JSON.

use serde::Serialize;

use crate::ProtocolError;
use crate::constants::MessageType;
use crate::envelope::Message;
use crate::messages::{
    DirectoryRequest, DirectoryResponse, EncryptedPayload, ErrorPayload, FileChunk,
    FileChunkRequest, FileInfoRequest, FileInfoResponse, FileTransferCancel, FileTransferRequest,
    FileTransferResponse, FileUploadCancel, FileUploadChunk, FileUploadChunkAck,
    FileUploadComplete, FileUploadRequest, FileUploadResponse, MetaRequest, MetaResponse,
};

/// One variant per wire message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    MetaRequest(MetaRequest),
    MetaResponse(MetaResponse),
    Error(ErrorPayload),
    DirectoryRequest(DirectoryRequest),
    DirectoryResponse(DirectoryResponse),
    FileInfoRequest(FileInfoRequest),
    FileInfoResponse(FileInfoResponse),
    FileTransferRequest(FileTransferRequest),
    FileTransferResponse(Box<FileTransferResponse>),
    FileChunkRequest(FileChunkRequest),
    FileChunkResponse(FileChunk),
    FileTransferCancel(FileTransferCancel),
    FileUploadRequest(FileUploadRequest),
    FileUploadResponse(FileUploadResponse),
    FileUploadChunk(FileUploadChunk),
    FileUploadChunkAck(FileUploadChunkAck),
    FileUploadComplete(FileUploadComplete),
    FileUploadCancel(FileUploadCancel),
    EncryptedRequest(EncryptedPayload),
    EncryptedResponse(EncryptedPayload),
}

fn parse<T: for<'de> serde::Deserialize<'de>>(msg: &Message) -> Result<T, ProtocolError> {
    msg.parse_payload::<T>()?
        .ok_or(ProtocolError::MissingPayload(msg.msg_type))
}

impl Body {
    /// Decodes the payload of `msg` according to its type.
    pub fn decode(msg: &Message) -> Result<Self, ProtocolError> {
        let body = match msg.msg_type {
            MessageType::MetaRequest => Body::MetaRequest(parse(msg)?),
            MessageType::MetaResponse => Body::MetaResponse(parse(msg)?),
            MessageType::Error => Body::Error(parse(msg)?),
            MessageType::DirectoryRequest => Body::DirectoryRequest(parse(msg)?),
            MessageType::DirectoryResponse => Body::DirectoryResponse(parse(msg)?),
            MessageType::FileInfoRequest => Body::FileInfoRequest(parse(msg)?),
            MessageType::FileInfoResponse => Body::FileInfoResponse(parse(msg)?),
            MessageType::FileTransferRequest => Body::FileTransferRequest(parse(msg)?),
            MessageType::FileTransferResponse => Body::FileTransferResponse(Box::new(parse(msg)?)),
            MessageType::FileChunkRequest => Body::FileChunkRequest(parse(msg)?),
            MessageType::FileChunkResponse => Body::FileChunkResponse(parse(msg)?),
            MessageType::FileTransferCancel => Body::FileTransferCancel(parse(msg)?),
            MessageType::FileUploadRequest => Body::FileUploadRequest(parse(msg)?),
            MessageType::FileUploadResponse => Body::FileUploadResponse(parse(msg)?),
            MessageType::FileUploadChunk => Body::FileUploadChunk(parse(msg)?),
            MessageType::FileUploadChunkAck => Body::FileUploadChunkAck(parse(msg)?),
            MessageType::FileUploadComplete => Body::FileUploadComplete(parse(msg)?),
            MessageType::FileUploadCancel => Body::FileUploadCancel(parse(msg)?),
            MessageType::EncryptedRequest => Body::EncryptedRequest(parse(msg)?),
            MessageType::EncryptedResponse => Body::EncryptedResponse(parse(msg)?),
            MessageType::Unknown => return Err(ProtocolError::UnknownType),
        };
        Ok(body)
    }

    /// Wire type of this body.
    pub fn msg_type(&self) -> MessageType {
        match self {
            Body::MetaRequest(_) => MessageType::MetaRequest,
            Body::MetaResponse(_) => MessageType::MetaResponse,
            Body::Error(_) => MessageType::Error,
            Body::DirectoryRequest(_) => MessageType::DirectoryRequest,
            Body::DirectoryResponse(_) => MessageType::DirectoryResponse,
            Body::FileInfoRequest(_) => MessageType::FileInfoRequest,
            Body::FileInfoResponse(_) => MessageType::FileInfoResponse,
            Body::FileTransferRequest(_) => MessageType::FileTransferRequest,
            Body::FileTransferResponse(_) => MessageType::FileTransferResponse,
            Body::FileChunkRequest(_) => MessageType::FileChunkRequest,
            Body::FileChunkResponse(_) => MessageType::FileChunkResponse,
            Body::FileTransferCancel(_) => MessageType::FileTransferCancel,
            Body::FileUploadRequest(_) => MessageType::FileUploadRequest,
            Body::FileUploadResponse(_) => MessageType::FileUploadResponse,
            Body::FileUploadChunk(_) => MessageType::FileUploadChunk,
            Body::FileUploadChunkAck(_) => MessageType::FileUploadChunkAck,
            Body::FileUploadComplete(_) => MessageType::FileUploadComplete,
            Body::FileUploadCancel(_) => MessageType::FileUploadCancel,
            Body::EncryptedRequest(_) => MessageType::EncryptedRequest,
            Body::EncryptedResponse(_) => MessageType::EncryptedResponse,
        }
    }

    /// Wraps this body in an envelope.
    pub fn into_message(self, correlation_id: Option<String>) -> Result<Message, ProtocolError> {
        fn wrap<T: Serialize>(
            msg_type: MessageType,
            payload: &T,
            correlation_id: Option<String>,
        ) -> Result<Message, ProtocolError> {
            Ok(Message::new(msg_type, Some(payload), correlation_id)?)
        }

        let msg_type = self.msg_type();
        match &self {
            Body::MetaRequest(p) => wrap(msg_type, p, correlation_id),
            Body::MetaResponse(p) => wrap(msg_type, p, correlation_id),
            Body::Error(p) => wrap(msg_type, p, correlation_id),
            Body::DirectoryRequest(p) => wrap(msg_type, p, correlation_id),
            Body::DirectoryResponse(p) => wrap(msg_type, p, correlation_id),
            Body::FileInfoRequest(p) => wrap(msg_type, p, correlation_id),
            Body::FileInfoResponse(p) => wrap(msg_type, p, correlation_id),
            Body::FileTransferRequest(p) => wrap(msg_type, p, correlation_id),
            Body::FileTransferResponse(p) => wrap(msg_type, p.as_ref(), correlation_id),
            Body::FileChunkRequest(p) => wrap(msg_type, p, correlation_id),
            Body::FileChunkResponse(p) => wrap(msg_type, p, correlation_id),
            Body::FileTransferCancel(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadRequest(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadResponse(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadChunk(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadChunkAck(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadComplete(p) => wrap(msg_type, p, correlation_id),
            Body::FileUploadCancel(p) => wrap(msg_type, p, correlation_id),
            Body::EncryptedRequest(p) => wrap(msg_type, p, correlation_id),
            Body::EncryptedResponse(p) => wrap(msg_type, p, correlation_id),
        }
    }
}
