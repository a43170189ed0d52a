//! EV3 wire protocol: frame codec, direct-command bytecode, re-framing.

pub mod bytecode;
pub mod framer;
pub mod packet;

pub use framer::{FramerConfig, extract_frames};
pub use packet::Packet;
