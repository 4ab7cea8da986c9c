use thiserror::Error;

/// Errors that can occur in the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A read consumed past the end of the message payload.
    #[error("Read past the end of the message")]
    EndOfMessage,
    /// A datagram or message header failed to parse. The datagram is dropped.
    #[error("Malformed datagram")]
    MalformedDatagram,
    /// A variable-length integer exceeded its maximum encoded size.
    #[error("Malformed variable-length integer")]
    MalformedVarint,
    /// A string payload was not valid UTF-8 or declared more bytes than remain.
    #[error("Malformed string payload")]
    MalformedString,
    /// A message that has already been transmitted was handed back to a send path.
    #[error("Message has already been sent and cannot be reused")]
    CannotResend,
    /// The connection is not in a state that can carry messages.
    #[error("Not connected")]
    NotConnected,
    /// A reliable message larger than the current MTU reached the enqueue path.
    #[error("Reliable message exceeds the current MTU")]
    OversizeReliable,
    /// A configuration value is out of range.
    /// Stored as a string because the offending values vary in type.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The socket returned a failure. Stored as a string because
    /// `std::io::Error` is neither `Clone` nor `Eq`.
    #[error("Socket failure: {0}")]
    Socket(String),
    /// The peer has not been started or has been shut down.
    #[error("Peer is not running")]
    NotRunning,
}

/// Outcome of a send call, reported synchronously to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The message will go out on the next transport tick.
    Sent,
    /// The message was accepted but is waiting behind the send window.
    Queued,
    /// No recipients were given.
    NoRecipients,
    /// The connection is not connected; nothing was enqueued.
    FailedNotConnected,
    /// The message was dropped by the configured size or overflow policy.
    Dropped,
}
