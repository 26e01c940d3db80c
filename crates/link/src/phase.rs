//! Connection phase state machine.
//!
//! ```text
//! DISCONNECTED --TransportOpened--> HANDSHAKING --HandshakeSucceeded--> ACTIVE
//!      ^                                 |                                 |
//!      +------HandshakeFailed / TransportClosed----------------------------+
//! ```
//!
//! The machine is owned by the task driving one link; its phase decides
//! which inbound message types are admitted.

use peershare_protocol::MessageType;

use crate::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Disconnected,
    Handshaking,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    TransportOpened,
    HandshakeSucceeded,
    HandshakeFailed,
    TransportClosed,
}

/// Verdict for an inbound message in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Application traffic before the handshake finished.
    HandshakeRequired,
    /// Handshake traffic after the link is already active.
    AlreadyActive,
    /// The link is closed; nothing is processed.
    Closed,
    /// Type not understood.
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: ConnectionPhase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == ConnectionPhase::Active
    }

    /// Applies `event`, returning the new phase.
    ///
    /// `TransportClosed` is valid from every phase.
    pub fn apply(&mut self, event: PhaseEvent) -> Result<ConnectionPhase, LinkError> {
        use ConnectionPhase::*;
        use PhaseEvent::*;

        let next = match (self.phase, event) {
            (Disconnected, TransportOpened) => Handshaking,
            (Handshaking, HandshakeSucceeded) => Active,
            (Handshaking, HandshakeFailed) => Disconnected,
            (_, TransportClosed) => Disconnected,
            (from, event) => return Err(LinkError::InvalidTransition { from, event }),
        };
        self.phase = next;
        Ok(next)
    }

    /// Decides whether a decoded (already unwrapped) message of `msg_type`
    /// may be processed now. `ERROR` is admitted in every open phase.
    pub fn admit(&self, msg_type: MessageType) -> Admission {
        if msg_type == MessageType::Unknown {
            return Admission::Unsupported;
        }
        match self.phase {
            ConnectionPhase::Disconnected => Admission::Closed,
            ConnectionPhase::Handshaking => {
                if msg_type.is_handshake() || msg_type == MessageType::Error {
                    Admission::Accept
                } else {
                    Admission::HandshakeRequired
                }
            }
            ConnectionPhase::Active => {
                if msg_type.is_handshake() {
                    Admission::AlreadyActive
                } else if msg_type.is_application() || msg_type == MessageType::Error {
                    Admission::Accept
                } else {
                    Admission::Unsupported
                }
            }
        }
    }

    /// Like [`admit`](Self::admit) but as a `Result`, for callers that
    /// surface violations as errors.
    pub fn check(&self, msg_type: MessageType) -> Result<(), LinkError> {
        match self.admit(msg_type) {
            Admission::Accept => Ok(()),
            _ => Err(LinkError::WrongPhase {
                phase: self.phase,
                msg_type,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let mut m = PhaseMachine::new();
        assert_eq!(m.phase(), ConnectionPhase::Disconnected);
        assert_eq!(
            m.apply(PhaseEvent::TransportOpened).unwrap(),
            ConnectionPhase::Handshaking
        );
        assert_eq!(
            m.apply(PhaseEvent::HandshakeSucceeded).unwrap(),
            ConnectionPhase::Active
        );
        assert!(m.is_active());
        assert_eq!(
            m.apply(PhaseEvent::TransportClosed).unwrap(),
            ConnectionPhase::Disconnected
        );
    }

    #[test]
    fn failed_handshake_disconnects() {
        let mut m = PhaseMachine::new();
        m.apply(PhaseEvent::TransportOpened).unwrap();
        assert_eq!(
            m.apply(PhaseEvent::HandshakeFailed).unwrap(),
            ConnectionPhase::Disconnected
        );
    }

    #[test]
    fn invalid_transitions_rejected() {
        let mut m = PhaseMachine::new();
        assert!(matches!(
            m.apply(PhaseEvent::HandshakeSucceeded),
            Err(LinkError::InvalidTransition { .. })
        ));
        m.apply(PhaseEvent::TransportOpened).unwrap();
        m.apply(PhaseEvent::HandshakeSucceeded).unwrap();
        assert!(m.apply(PhaseEvent::TransportOpened).is_err());
        assert!(m.apply(PhaseEvent::HandshakeFailed).is_err());
        assert!(m.is_active());
    }

    #[test]
    fn handshaking_admits_only_handshake_traffic() {
        let mut m = PhaseMachine::new();
        m.apply(PhaseEvent::TransportOpened).unwrap();
        assert_eq!(m.admit(MessageType::MetaRequest), Admission::Accept);
        assert_eq!(m.admit(MessageType::Error), Admission::Accept);
        assert_eq!(
            m.admit(MessageType::DirectoryRequest),
            Admission::HandshakeRequired
        );
        assert!(m.check(MessageType::FileUploadChunk).is_err());
    }

    #[test]
    fn active_admits_application_traffic() {
        let mut m = PhaseMachine::new();
        m.apply(PhaseEvent::TransportOpened).unwrap();
        m.apply(PhaseEvent::HandshakeSucceeded).unwrap();
        assert_eq!(m.admit(MessageType::FileChunkRequest), Admission::Accept);
        assert_eq!(m.admit(MessageType::MetaRequest), Admission::AlreadyActive);
        assert_eq!(m.admit(MessageType::Unknown), Admission::Unsupported);
        assert_eq!(
            m.admit(MessageType::EncryptedRequest),
            Admission::Unsupported
        );
    }

    #[test]
    fn disconnected_admits_nothing() {
        let m = PhaseMachine::new();
        assert_eq!(m.admit(MessageType::MetaRequest), Admission::Closed);
    }
}
