use std::fmt;

/// Classification returned by a codec when pulling one packet out of the
/// accumulator. The framing engine is the only consumer; everything above it
/// sees [RpcError].
///
/// NOTE Recoverable outcome: only `NotEnoughData`, and `BadSchema` while the
/// connection is still unbound.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    Clone,
    Copy,
    thiserror::Error,
)]
pub enum DecodeError {
    /// The accumulator does not hold a whole packet yet; the cursor is intact.
    #[strum(serialize = "not_enough_data")]
    NotEnoughData,
    /// The bytes do not parse as this protocol.
    #[strum(serialize = "bad_schema")]
    BadSchema,
    /// Declared body size exceeds the hard cap; fatal on the connection.
    #[strum(serialize = "too_big_data")]
    TooBigData,
}

impl fmt::Debug for DecodeError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Stable error kinds above the framing seam.
///
/// `Timeout` is local-only and never serialized; the rest map onto wire
/// error codes where the protocol carries one.
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    PartialEq,
    Eq,
    Clone,
    Copy,
    thiserror::Error,
)]
pub enum RpcErrorKind {
    /// The packet framed correctly but meta or body could not be parsed.
    #[strum(serialize = "rpc_serialization")]
    SerializationFailure,
    /// Dispatch found no target, or user code failed.
    #[strum(serialize = "rpc_service")]
    ServiceException,
    /// Transport closed or stream reset; cancels outstanding requests.
    #[strum(serialize = "rpc_network")]
    NetworkError,
    #[strum(serialize = "rpc_timeout")]
    Timeout,
}

impl fmt::Debug for RpcErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Wire error numbers carried unchanged in response metas.
pub mod errno {
    /// The service name in request is not found.
    pub const ENOSERVICE: i32 = 1001;
    /// The method in request is not found.
    pub const ENOMETHOD: i32 = 1002;
    /// Bad request: malformed meta, duplicate correlation id.
    pub const EREQUEST: i32 = 1003;
    /// Server-side internal failure.
    pub const EINTERNAL: i32 = 2001;
    /// Bad response from the remote side.
    pub const ERESPONSE: i32 = 2002;
}

/// An error above the framing seam, optionally carrying the wire error code.
#[derive(Clone, PartialEq, Eq, thiserror::Error)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    /// Wire-visible code when the protocol carries one, 0 otherwise.
    pub code: i32,
    pub message: String,
}

impl RpcError {
    #[inline]
    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self {
            kind: RpcErrorKind::SerializationFailure,
            code: errno::EREQUEST,
            message: message.into(),
        }
    }

    #[inline]
    pub fn service<S: Into<String>>(code: i32, message: S) -> Self {
        Self { kind: RpcErrorKind::ServiceException, code, message: message.into() }
    }

    #[inline]
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self { kind: RpcErrorKind::NetworkError, code: 0, message: message.into() }
    }

    #[inline]
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self { kind: RpcErrorKind::Timeout, code: 0, message: message.into() }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.code != 0 {
            write!(f, "{}({}): {}", self.kind, self.code, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::io::Error> for RpcError {
    #[inline]
    fn from(e: std::io::Error) -> Self {
        Self::network(e.to_string())
    }
}

impl std::cmp::PartialEq<RpcErrorKind> for RpcError {
    #[inline]
    fn eq(&self, other: &RpcErrorKind) -> bool {
        self.kind == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_decode_error_str() {
        let s = DecodeError::NotEnoughData.as_ref();
        assert_eq!(s, "not_enough_data");
        let e = DecodeError::from_str(s).expect("parse");
        assert_eq!(e, DecodeError::NotEnoughData);
        assert!(DecodeError::from_str("almost_enough_data").is_err());
    }

    #[test]
    fn test_rpc_error_display() {
        let e = RpcError::service(errno::ENOMETHOD, "no such method");
        assert_eq!(e, RpcErrorKind::ServiceException);
        assert_eq!(format!("{}", e), "rpc_service(1002): no such method");
        let e = RpcError::timeout("write deadline");
        assert_eq!(format!("{}", e), "rpc_timeout: write deadline");
    }
}
