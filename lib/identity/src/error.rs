//! Error types for the identity crate.
//!
//! Each concern gets its own error enum with an explicit retry policy:
//! - `DecodeError`: malformed credential, always local and non-retryable
//! - `SessionStoreError`: session mutation or persistence failures
//! - `ExchangeError`: token endpoint failures, retryability per grant
//! - `GatewayError`: authenticated-call failures after renewal is exhausted
//! - `HandshakeError`: invitation handshake failures

use std::fmt;

/// Errors from structurally decoding an access credential.
///
/// Decoding is a pure parse; signature and expiry validation are the
/// provider's and the gateway's concerns respectively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The credential did not have the expected three dot-separated segments.
    WrongSegmentCount { found: usize },
    /// The payload segment was not valid base64url.
    InvalidEncoding { reason: String },
    /// The payload decoded but was not a usable JSON claims object.
    MalformedPayload { reason: String },
    /// The claims object carried no subject.
    MissingSubject,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSegmentCount { found } => {
                write!(f, "expected 3 credential segments, found {found}")
            }
            Self::InvalidEncoding { reason } => {
                write!(f, "credential payload is not valid base64url: {reason}")
            }
            Self::MalformedPayload { reason } => {
                write!(f, "credential payload is not a claims object: {reason}")
            }
            Self::MissingSubject => {
                write!(f, "credential claims carry no subject")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from session store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    /// The new access credential could not be decoded into claims.
    InvalidCredential { source: DecodeError },
    /// The persistence backend failed to load or save the session.
    Persistence { reason: String },
}

impl fmt::Display for SessionStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredential { source } => {
                write!(f, "cannot store session: {source}")
            }
            Self::Persistence { reason } => {
                write!(f, "session persistence failed: {reason}")
            }
        }
    }
}

impl std::error::Error for SessionStoreError {}

/// Errors from token endpoint exchanges.
///
/// The retry policy depends on the grant that failed:
/// - `InvalidGrant` on a password grant surfaces as bad credentials
/// - `InvalidGrant` on a refresh grant means the refresh credential is
///   dead and the session must be torn down, never retried
/// - `InvalidGrant` on a code grant means the single-use code is spent
///   and must never be re-submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// The provider rejected the grant itself.
    InvalidGrant { description: String },
    /// The provider could not be reached, or the call timed out.
    Network { reason: String },
    /// The provider answered with a non-grant error.
    Provider { status: u16, description: String },
    /// The exchange client could not be constructed from its configuration.
    Configuration { reason: String },
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidGrant { description } => {
                write!(f, "grant rejected: {description}")
            }
            Self::Network { reason } => {
                write!(f, "token endpoint unreachable: {reason}")
            }
            Self::Provider { status, description } => {
                write!(f, "provider error ({status}): {description}")
            }
            Self::Configuration { reason } => {
                write!(f, "exchange client configuration error: {reason}")
            }
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Errors from the authenticated request gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No session exists; the caller must route to login.
    Unauthenticated,
    /// Renewal was exhausted; the session has been cleared and the caller
    /// must redirect to login.
    SessionExpired,
    /// The resource API could not be reached.
    Network { reason: String },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "no active session"),
            Self::SessionExpired => write!(f, "session expired and renewal failed"),
            Self::Network { reason } => write!(f, "resource API unreachable: {reason}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Errors from the invitation handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// The redirect state parameter failed its shape or version check.
    InvalidState { reason: String },
    /// The round-tripped state did not match the value that was sent.
    StateMismatch,
    /// The handshake was driven from a phase that does not allow the
    /// requested transition.
    WrongPhase { expected: &'static str },
    /// The server or provider could not be reached.
    Network { reason: String },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { reason } => {
                write!(f, "invalid redirect state: {reason}")
            }
            Self::StateMismatch => {
                write!(f, "redirect state does not match the value sent")
            }
            Self::WrongPhase { expected } => {
                write!(f, "handshake is not in the {expected} phase")
            }
            Self::Network { reason } => {
                write!(f, "handshake endpoint unreachable: {reason}")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}
