//! Error types for the Roomba client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoombaError {
    /// Host or port could not be reached (TCP/UDP level, or a timeout).
    #[error("connection: {0}")]
    Connection(String),

    /// TLS negotiation or the credential probe exchange failed.
    #[error("handshake: {0}")]
    Handshake(String),

    /// Malformed telemetry or discovery reply.
    #[error("decode: {0}")]
    Decode(String),

    /// Caller supplied an argument the device cannot accept.
    #[error("argument: {0}")]
    Argument(String),

    /// A discovery run is already in progress.
    #[error("discovery already in progress")]
    Concurrency,

    #[error("Config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS: {0}")]
    Tls(#[from] rustls::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MQTT client: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),
}

pub type Result<T> = std::result::Result<T, RoombaError>;
