//! Multi-transport command pipeline for LEGO MINDSTORMS EV3 bricks:
//! bit-exact packet codec, USB HID / Bluetooth SPP / TCP adapters with
//! reply correlation, auto-selection policies, a prioritised command
//! scheduler, and a mock brick for offline testing.

pub mod bluetooth;
pub mod cancel;
pub mod error;
pub mod mock;
pub mod protocol;
pub mod scheduler;
pub mod transport;

pub use cancel::{CancelSource, CancelToken};
pub use error::TransportError;
pub use protocol::Packet;
pub use scheduler::{CommandClient, CommandRequest, CommandResult, Lane};
pub use transport::{SendOptions, Transport};
