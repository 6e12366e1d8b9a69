//! Connection-opening frames and session identifiers

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a session identifier on the wire
pub const SESSION_ID_LEN: usize = 36;

/// Length of project and agent identifiers in a full-auth frame
///
/// The gateway issues both as hyphenated UUIDs, so the reference decoder
/// splits the frame at fixed offsets.
pub const AGENT_IDENTIFIER_LEN: usize = 36;

/// Protocol message errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown connection type byte: 0x{0:02x}")]
    UnknownConnectionType(u8),

    #[error("Truncated frame: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unexpected trailing bytes: expected {expected} bytes, got {actual}")]
    TrailingBytes { expected: usize, actual: usize },

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Frame field is not valid UTF-8")]
    InvalidUtf8,
}

/// First byte of every agent-initiated connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Control channel authenticated with project id, agent id and token
    Control,
    /// Session channel for one gateway-issued session id
    Session,
    /// Control channel authenticated with the access token only
    AnonymousControl,
}

impl ConnectionType {
    pub const fn as_byte(self) -> u8 {
        match self {
            ConnectionType::Control => b'1',
            ConnectionType::Session => b'2',
            ConnectionType::AnonymousControl => b'3',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, MessageError> {
        match byte {
            b'1' => Ok(ConnectionType::Control),
            b'2' => Ok(ConnectionType::Session),
            b'3' => Ok(ConnectionType::AnonymousControl),
            other => Err(MessageError::UnknownConnectionType(other)),
        }
    }
}

/// Opaque 36-character session identifier pushed by the gateway
///
/// The agent never interprets it; it is only echoed back when the matching
/// session channel is opened. Validation is limited to length and UTF-8 so the
/// echo is byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() != SESSION_ID_LEN {
            return Err(MessageError::InvalidSessionId(format!(
                "expected {} bytes, got {}",
                SESSION_ID_LEN,
                bytes.len()
            )));
        }

        let id = std::str::from_utf8(bytes).map_err(|_| MessageError::InvalidUtf8)?;
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl FromStr for SessionId {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The frame an agent writes right after the TLS handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// `'1' ‖ project_id ‖ agent_id ‖ agent_access_token`
    Control {
        project_id: String,
        agent_id: String,
        agent_access_token: String,
    },
    /// `'3' ‖ agent_access_token`
    AnonymousControl { agent_access_token: String },
    /// `'2' ‖ session_id`
    Session { session_id: SessionId },
}

impl Handshake {
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            Handshake::Control { .. } => ConnectionType::Control,
            Handshake::AnonymousControl { .. } => ConnectionType::AnonymousControl,
            Handshake::Session { .. } => ConnectionType::Session,
        }
    }

    /// Encode the frame. Fields are concatenated without delimiters.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload_len());
        buf.put_u8(self.connection_type().as_byte());

        match self {
            Handshake::Control {
                project_id,
                agent_id,
                agent_access_token,
            } => {
                buf.put_slice(project_id.as_bytes());
                buf.put_slice(agent_id.as_bytes());
                buf.put_slice(agent_access_token.as_bytes());
            }
            Handshake::AnonymousControl { agent_access_token } => {
                buf.put_slice(agent_access_token.as_bytes());
            }
            Handshake::Session { session_id } => {
                buf.put_slice(session_id.as_bytes());
            }
        }

        buf.freeze()
    }

    /// Decode a complete frame the way the gateway does
    ///
    /// The frame carries no lengths, so full-auth frames are split at
    /// [`AGENT_IDENTIFIER_LEN`] boundaries and the token takes the remainder.
    pub fn decode(frame: &[u8]) -> Result<Self, MessageError> {
        let (&type_byte, payload) = frame.split_first().ok_or(MessageError::Empty)?;

        match ConnectionType::from_byte(type_byte)? {
            ConnectionType::Control => {
                let ids_len = 2 * AGENT_IDENTIFIER_LEN;
                if payload.len() <= ids_len {
                    return Err(MessageError::Truncated {
                        expected: 1 + ids_len + 1,
                        actual: frame.len(),
                    });
                }

                let (project_id, rest) = payload.split_at(AGENT_IDENTIFIER_LEN);
                let (agent_id, token) = rest.split_at(AGENT_IDENTIFIER_LEN);

                Ok(Handshake::Control {
                    project_id: utf8_field(project_id)?,
                    agent_id: utf8_field(agent_id)?,
                    agent_access_token: utf8_field(token)?,
                })
            }
            ConnectionType::AnonymousControl => {
                if payload.is_empty() {
                    return Err(MessageError::Truncated {
                        expected: 2,
                        actual: frame.len(),
                    });
                }

                Ok(Handshake::AnonymousControl {
                    agent_access_token: utf8_field(payload)?,
                })
            }
            ConnectionType::Session => {
                let expected = 1 + SESSION_ID_LEN;
                if frame.len() < expected {
                    return Err(MessageError::Truncated {
                        expected,
                        actual: frame.len(),
                    });
                }
                if frame.len() > expected {
                    return Err(MessageError::TrailingBytes {
                        expected,
                        actual: frame.len(),
                    });
                }

                Ok(Handshake::Session {
                    session_id: SessionId::from_bytes(payload)?,
                })
            }
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Handshake::Control {
                project_id,
                agent_id,
                agent_access_token,
            } => project_id.len() + agent_id.len() + agent_access_token.len(),
            Handshake::AnonymousControl { agent_access_token } => agent_access_token.len(),
            Handshake::Session { .. } => SESSION_ID_LEN,
        }
    }
}

fn utf8_field(bytes: &[u8]) -> Result<String, MessageError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| MessageError::InvalidUtf8)
}
