use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Packet kinds of the socket.io 0.9 line protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Disconnect,
    /// Server signals the session is up.
    Connect,
    Heartbeat,
    /// Client-originated RPC call.
    Message,
    /// JSON message: either a `notify` event or a `reqid` response.
    Json,
    Event,
    Ack,
    Error,
    Noop,
}

impl FrameKind {
    pub fn code(self) -> u8 {
        match self {
            FrameKind::Disconnect => 0,
            FrameKind::Connect => 1,
            FrameKind::Heartbeat => 2,
            FrameKind::Message => 3,
            FrameKind::Json => 4,
            FrameKind::Event => 5,
            FrameKind::Ack => 6,
            FrameKind::Error => 7,
            FrameKind::Noop => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            0 => FrameKind::Disconnect,
            1 => FrameKind::Connect,
            2 => FrameKind::Heartbeat,
            3 => FrameKind::Message,
            4 => FrameKind::Json,
            5 => FrameKind::Event,
            6 => FrameKind::Ack,
            7 => FrameKind::Error,
            8 => FrameKind::Noop,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("unknown frame kind {0}")]
    UnknownKind(String),
    #[error("invalid frame id {0}")]
    InvalidId(String),
    #[error("invalid json payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One wire unit exchanged over the push socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: Option<u64>,
    pub has_more: bool,
    pub endpoint: Option<String>,
    pub payload: Option<Value>,
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            id: None,
            has_more: false,
            endpoint: None,
            payload: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameKind::Heartbeat)
    }

    pub fn call(payload: Value) -> Self {
        Self::new(FrameKind::Message).with_payload(payload)
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parses `kind ':' [id] ['+'] ':' [endpoint] [':' [json]]`.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let (kind_text, rest) = line
            .split_once(':')
            .ok_or(FrameError::Malformed("missing field separator"))?;
        if kind_text.is_empty() {
            return Err(FrameError::Malformed("empty kind"));
        }
        let kind = kind_text
            .parse::<u8>()
            .ok()
            .and_then(FrameKind::from_code)
            .ok_or_else(|| FrameError::UnknownKind(kind_text.to_string()))?;

        let (id_field, rest) = rest
            .split_once(':')
            .ok_or(FrameError::Malformed("missing endpoint separator"))?;
        let (id_text, has_more) = match id_field.strip_suffix('+') {
            Some(digits) => (digits, true),
            None => (id_field, false),
        };
        let id = if id_text.is_empty() {
            None
        } else if id_text.bytes().all(|b| b.is_ascii_digit()) {
            Some(
                id_text
                    .parse::<u64>()
                    .map_err(|_| FrameError::InvalidId(id_text.to_string()))?,
            )
        } else {
            return Err(FrameError::InvalidId(id_field.to_string()));
        };

        let (endpoint, data) = match rest.split_once(':') {
            Some((endpoint, data)) => (endpoint, data),
            None => (rest, ""),
        };
        let endpoint = (!endpoint.is_empty()).then(|| endpoint.to_string());
        let payload = if data.is_empty() {
            None
        } else {
            Some(serde_json::from_str(data)?)
        };

        Ok(Self {
            kind,
            id,
            has_more,
            endpoint,
            payload,
        })
    }

    /// Encodes as `kind:id:endpoint[:json]`; absent fields stay empty.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.kind.code())?;
        if let Some(id) = self.id {
            write!(f, "{id}")?;
        }
        if self.has_more {
            f.write_str("+")?;
        }
        f.write_str(":")?;
        if let Some(endpoint) = &self.endpoint {
            f.write_str(endpoint)?;
        }
        if let Some(payload) = &self.payload {
            write!(f, ":{payload}")?;
        }
        Ok(())
    }
}
