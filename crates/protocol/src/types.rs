use serde::{Deserialize, Serialize};

/// An entry of a shared directory listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
}

/// Capabilities the host advertises on a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFeatures {
    pub upload_allowed: bool,
    pub encrypted: bool,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub protocol_version: u32,
}

/// Lifecycle of a single transfer.
///
/// A one-way progression; `Completed`, `Error` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Initializing,
    Transferring,
    Assembling,
    Completed,
    Error,
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` for states a transfer never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Error | TransferStatus::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            TransferStatus::Initializing => 0,
            TransferStatus::Transferring => 1,
            TransferStatus::Assembling => 2,
            TransferStatus::Completed | TransferStatus::Error | TransferStatus::Cancelled => 3,
        }
    }

    /// Returns `true` if moving from `self` to `next` respects the one-way order.
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.is_terminal() || next.rank() >= self.rank()
    }
}

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// 0..=100.
    pub progress: f64,
    pub speed_bytes_per_sec: f64,
    pub status: TransferStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            TransferStatus::Completed,
            TransferStatus::Error,
            TransferStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(TransferStatus::Transferring));
            assert!(!terminal.can_advance_to(TransferStatus::Cancelled));
        }
    }

    #[test]
    fn progression_is_one_way() {
        assert!(TransferStatus::Initializing.can_advance_to(TransferStatus::Transferring));
        assert!(TransferStatus::Transferring.can_advance_to(TransferStatus::Assembling));
        assert!(TransferStatus::Transferring.can_advance_to(TransferStatus::Cancelled));
        assert!(!TransferStatus::Assembling.can_advance_to(TransferStatus::Transferring));
    }

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::Assembling).unwrap(),
            "\"ASSEMBLING\""
        );
    }

    #[test]
    fn file_entry_omits_missing_fields() {
        let entry = FileEntry {
            name: "docs".into(),
            path: "/docs".into(),
            is_directory: true,
            size: None,
            mime_type: None,
            modified_at: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"name":"docs","path":"/docs","isDirectory":true}"#);
    }
}
