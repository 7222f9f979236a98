use thiserror::Error;

/// Errors surfaced by the transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Message too large")]
    MessageTooLarge,
    #[error("Message empty")]
    MessageEmpty,
    #[error("Packet too short")]
    PacketTooShort,
    #[error("Unknown packet type {0:#04x}")]
    UnknownPacketType(u8),
    #[error("Malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("Unknown RPC")]
    UnknownRpc,
    #[error("RPC is not awaiting a reply")]
    NotInService,
    #[error("Socket has been shut down")]
    Shutdown,
    #[error("No message ready")]
    WouldBlock,
    #[error("Receive flags select no message class")]
    InvalidFlags,
    #[error("Peer timed out")]
    PeerTimeout,
    #[error("Peer unreachable")]
    PeerUnreachable,
    #[error("RPC aborted")]
    Aborted,
    #[error("No ports available")]
    PortsExhausted,
    #[error("Port already bound")]
    PortInUse,
    #[error("Port {0} is outside the server port range")]
    InvalidPort(u16),
    #[error("Transmission failed")]
    SendFailed,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
