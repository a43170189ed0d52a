use thiserror::Error;

/// Failures surfaced by the command pipeline and its transports.
///
/// Retry and rediscovery decisions are never made by matching on these
/// messages at call sites; the Bluetooth auto-port loop routes them through
/// [`crate::bluetooth::classify`] instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("packet of {len} bytes does not fit a {report_size}-byte HID report")]
    PayloadTooLarge { len: usize, report_size: usize },

    #[error("a command is already in flight on this transport")]
    AlreadyInFlight,

    #[error("request aborted")]
    Aborted,

    #[error("request timed out")]
    Timeout,

    #[error("transport is not open")]
    NotOpen,

    #[error("transport closed while a command was in flight")]
    TransportClosed,

    #[error("EV3 unlock handshake rejected: {0}")]
    UnlockHandshakeFailed(String),

    #[error("reply does not match request: {0}")]
    ProtocolMismatch(String),

    #[error("value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("serial port error: {0}")]
    Serial(String),

    #[error("HID error: {0}")]
    Hid(String),

    #[error("device io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no transport candidate could be opened: {0}")]
    AutoTransportFailed(String),

    #[error("no Bluetooth COM port accepted the probe: {0}")]
    BluetoothAutoPortFailed(String),
}

impl From<hidapi::HidError> for TransportError {
    fn from(err: hidapi::HidError) -> Self {
        Self::Hid(err.to_string())
    }
}

impl TransportError {
    /// True for failures scoped to a single request; the adapter stays
    /// usable and the next send may proceed.
    pub fn is_request_scoped(&self) -> bool {
        matches!(self, Self::Aborted | Self::Timeout | Self::PayloadTooLarge { .. })
    }
}
