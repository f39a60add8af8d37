//! Module that contains all the different message types sent between peers.

use color_print::cformat;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, error::Error, fmt};

/// Identity of a peer, assigned from outside the lock.
pub type PeerId = u64;

/// Logical (Lamport) time.
pub type Timestamp = u64;

/// Last time each peer used the token. Travels with the token.
pub type TokenRecord = BTreeMap<PeerId, Timestamp>;

/// Enum that represents the remote interface of a peer's lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum Request {
    /// Peer `pid` wants the token, asked at logical time `time`.
    RequestToken { time: Timestamp, pid: PeerId },
    /// The token is being handed to the receiver.
    ObtainToken { token: TokenRecord },
    /// Peer `pid`, reachable at `address`, joined the group.
    RegisterPeer { pid: PeerId, address: String },
    /// Peer `pid` left the group.
    UnregisterPeer { pid: PeerId },
    /// Liveness check, answered with the peer id.
    Check,
}

/// Successful outcome of a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ack,
    Identity(PeerId),
}

/// Fixed set of failures a peer reports back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Accepting the call would put a second token in flight.
    ProtocolViolation,
    /// The call names a peer the receiver can't account for.
    UnknownPeer,
    /// The request line couldn't be decoded.
    Malformed,
    /// The receiver already left the group.
    Departed,
}

/// Enum that represents the answer to a `Request`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ok(Reply),
    Err { kind: ErrorKind, details: String },
}

impl Request {
    /// Function that returns the request as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the request from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(line)?)
    }

    /// Name of the remote method, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::RequestToken { .. } => "requestToken",
            Self::ObtainToken { .. } => "obtainToken",
            Self::RegisterPeer { .. } => "registerPeer",
            Self::UnregisterPeer { .. } => "unregisterPeer",
            Self::Check => "check",
        }
    }

    /// Function that returns a colored one-line description of the request.
    pub fn describe(&self) -> String {
        match self {
            Self::RequestToken { time, pid } => cformat!(
                "<bold>requestToken</bold> from peer <bold>{pid}</bold> at time <bold>{time}</bold>"
            ),
            Self::ObtainToken { token } => cformat!(
                "<bold>obtainToken</bold> carrying <yellow, bold>{}</yellow, bold>",
                format_table(token)
            ),
            Self::RegisterPeer { pid, address } => cformat!(
                "<bold>registerPeer</bold> <bold>{pid}</bold> at <bold>{address}</bold>"
            ),
            Self::UnregisterPeer { pid } => {
                cformat!("<bold>unregisterPeer</bold> <bold>{pid}</bold>")
            }
            Self::Check => cformat!("<bold>check</bold>"),
        }
    }
}

impl Response {
    /// Function that returns the response as a JSON formatted `String`.
    pub fn to_json_string(&self) -> Result<String, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::to_string(self)?)
    }

    /// Function that parses the response from a JSON formatted `String`.
    pub fn from_json_string(line: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_str::<Self>(line)?)
    }

    pub fn ack() -> Self {
        Self::Ok(Reply::Ack)
    }

    pub fn err(kind: ErrorKind, details: impl Into<String>) -> Self {
        Self::Err {
            kind,
            details: details.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolViolation => "protocol violation",
            Self::UnknownPeer => "unknown peer",
            Self::Malformed => "malformed request",
            Self::Departed => "peer departed",
        };
        f.write_str(name)
    }
}

/// Renders a peer table as `{1: 0, 3: 7}`.
pub fn format_table(table: &BTreeMap<PeerId, Timestamp>) -> String {
    let entries = table
        .iter()
        .map(|(pid, time)| format!("{pid}: {time}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{entries}}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_method_and_args_tags() {
        let line = Request::RequestToken { time: 4, pid: 2 }
            .to_json_string()
            .unwrap();
        assert_eq!(line, r#"{"method":"RequestToken","args":{"time":4,"pid":2}}"#);
    }

    #[test]
    fn token_record_keys_survive_json() {
        let token = TokenRecord::from([(1, 0), (3, 9)]);
        let line = Request::ObtainToken {
            token: token.clone(),
        }
        .to_json_string()
        .unwrap();

        match Request::from_json_string(&line).unwrap() {
            Request::ObtainToken { token: decoded } => assert_eq!(decoded, token),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn check_has_no_args() {
        let decoded = Request::from_json_string(r#"{"method":"Check"}"#).unwrap();
        assert_eq!(decoded, Request::Check);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Request::from_json_string("obtain the token please").is_err());
        assert!(Request::from_json_string(r#"{"method":"Steal","args":{}}"#).is_err());
    }

    #[test]
    fn error_response_carries_kind() {
        let line = Response::err(ErrorKind::ProtocolViolation, "two tokens")
            .to_json_string()
            .unwrap();
        assert_eq!(
            Response::from_json_string(&line).unwrap(),
            Response::Err {
                kind: ErrorKind::ProtocolViolation,
                details: "two tokens".to_string(),
            }
        );
    }

    #[test]
    fn table_formatting() {
        assert_eq!(format_table(&TokenRecord::new()), "{}");
        assert_eq!(format_table(&TokenRecord::from([(1, 0), (5, 10)])), "{1: 0, 5: 10}");
    }
}
