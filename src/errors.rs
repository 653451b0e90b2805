use serde_json::Value;

/// Failures arising from the UDP transport, the WebSocket transport, or the
/// codec while establishing or maintaining a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The WebSocket handshake did not complete within the configured timeout.
    #[error("connection handshake timed out")]
    ConnectTimeout,

    /// The underlying WebSocket library returned an error during connect,
    /// send, or close.
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// The remote closed the socket.
    #[error("websocket closed: code={code:?} reason={reason:?}")]
    Closed { code: Option<u16>, reason: Option<String> },

    /// A text frame arrived instead of the expected binary framing; the
    /// bytes are still forwarded to the decoder, so this is logged, not
    /// fatal.
    #[error("unexpected binary payload")]
    UnexpectedBinary,
}

/// Failures from the request router: a request's terminal response was not
/// `Success`/`Registered`, or the connection dropped while the request was
/// outstanding.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The connection was lost while this request was still pending.
    #[error("disconnected while request was in flight")]
    Disconnected,

    /// The caller-side deadline elapsed before a response arrived. The
    /// pending entry is left in place: a late response is still delivered
    /// to nobody, matching the "timeout does not mutate the pending table"
    /// contract.
    #[error("request timed out waiting for a response")]
    Timeout,

    /// The Core replied with a terminal frame whose name was neither
    /// `Success` nor `Registered`.
    #[error("request failed: {name}")]
    Failed { name: String, body: Option<Value> },
}

/// Failures from the registration handshake run at the start of every
/// connect/reconnect attempt.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("registration request timed out")]
    Timeout,

    #[error("registration rejected: {name}")]
    Rejected { name: String, body: Option<Value> },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures from the discovery client.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no usable non-loopback IPv4 interfaces were found")]
    NoInterfaces,
}

/// Top-level error returned by the public [`crate::connection::Connection`] API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("malformed frame could not be encoded: {0}")]
    Codec(#[from] serde_json::Error),
}
