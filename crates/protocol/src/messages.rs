use serde::{Deserialize, Serialize};

use crate::types::{FileEntry, HostFeatures};

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// Sent by the client to open (or retry) the handshake.
///
/// `sealed` carries the literal hello encrypted under the client's
/// passphrase-derived key; it is absent on the first, plaintext attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<EncryptedPayload>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol_version: u32,
}

/// Host reply during the handshake.
///
/// `message` is one of `hello`, `encrypted` or `mismatch`; `features` is only
/// present on a successful `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<HostFeatures>,
    /// Passphrase attempts left before the host drops the link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_left: Option<u32>,
}

/// Body of an `ERROR` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}

/// Ciphertext + nonce, base64-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Browsing payloads
// ---------------------------------------------------------------------------

/// Lists a directory of the shared tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    pub path: String,
}

/// Directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryResponse {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

/// Asks for a single file's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfoRequest {
    pub path: String,
}

/// File metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoResponse {
    pub path: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Download payloads
// ---------------------------------------------------------------------------

/// Opens a download of `path`, optionally limited to `[range_start, range_end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRequest {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// Accepted download: session metadata plus chunk 0, sent unprompted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferResponse {
    pub file_id: String,
    pub path: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    pub total_size: u64,
    pub range_start: u64,
    pub range_end: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub first_chunk: FileChunk,
}

/// Pulls one subsequent chunk of an accepted download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkRequest {
    pub file_id: String,
    pub chunk_index: u64,
    pub path: String,
    pub start: u64,
    pub end: u64,
}

/// One chunk of file data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_first: bool,
    pub is_last: bool,
}

/// Abandons a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferCancel {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Upload payloads
// ---------------------------------------------------------------------------

/// Asks the host to accept an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadRequest {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_type: String,
    pub file_size: u64,
    pub total_chunks: u64,
    pub chunk_size: u64,
}

/// Host accepts an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadResponse {
    pub upload_id: String,
    pub ready: bool,
}

/// One chunk of upload data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadChunk {
    pub upload_id: String,
    pub chunk_index: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_last: bool,
}

/// Host acknowledgement of an upload chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadChunkAck {
    pub upload_id: String,
    pub chunk_index: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub duplicate: bool,
}

/// Host notification that an upload finished (or failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadComplete {
    pub upload_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default)]
    pub size: u64,
    /// Hex SHA-256 of the bytes written to storage.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Abandons an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadCancel {
    pub upload_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Serde helper encoding `Vec<u8>` as standard base64 text.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
