//! Transport adapters carrying EV3 packets over USB HID, Bluetooth SPP and
//! TCP, plus the composites that pick among them and the mock used offline.

pub mod auto;
pub mod bluetooth_auto;
pub mod bluetooth_spp;
pub mod factory;
pub mod mock;
mod reply;
pub mod tcp;
pub mod usb_hid;

use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::TransportError;
use crate::protocol::Packet;

pub use auto::{AutoTransport, TransportCandidate};
pub use bluetooth_auto::{BluetoothAutoPortConfig, BluetoothAutoPortTransport};
pub use bluetooth_spp::{BluetoothSppConfig, BluetoothSppTransport};
pub use factory::{
    MapSettings, SettingsSource, TransportSettings, build_auto_transport, build_mock_responder,
    build_transport,
};
pub use mock::MockTransport;
pub use tcp::{Beacon, TcpConfig, TcpTransport};
pub use usb_hid::{UsbHidConfig, UsbHidTransport};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-request options for [`Transport::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Measured from the write; on expiry the pending reply is rejected
    /// with [`TransportError::Timeout`] and the adapter stays open.
    pub timeout: Duration,
    pub cancel: CancelToken,
    /// When set, received packets with any other message counter are
    /// discarded instead of resolving this request. Transports can deliver
    /// stale or duplicated packets after a reconnect.
    pub expected_message_counter: Option<u16>,
}

impl SendOptions {
    pub fn expecting(counter: u16) -> Self {
        Self {
            expected_message_counter: Some(counter),
            ..Self::default()
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SEND_TIMEOUT,
            cancel: CancelToken::never(),
            expected_message_counter: None,
        }
    }
}

/// A packet conduit to one EV3 brick.
///
/// Contract, uniform across implementations:
/// - at most one send may be in flight; a second concurrent send fails with
///   [`TransportError::AlreadyInFlight`],
/// - cancellation rejects the pending reply with `Aborted` and leaves the
///   adapter open,
/// - an IO failure while a send is in flight closes the adapter; every
///   later send fails with `NotOpen` until `open` is called again,
/// - `open` and `close` are idempotent, and dropping an unfinished `open`
///   future releases whatever it had acquired.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&mut self) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Writes `packet` and, for the command types that solicit a reply,
    /// waits for the matching frame. Returns `None` for fire-and-forget
    /// command types.
    async fn send(
        &mut self,
        packet: &Packet,
        opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError>;

    fn is_open(&self) -> bool;
}
