//! Offline brick: simulated world state, a responder interpreting the
//! command set against it, and a fault layer for failure-path testing.

pub mod faults;
pub mod responder;
pub mod world;

pub use faults::{FaultConfig, FaultInjector};
pub use responder::{CommandResponder, Responder};
pub use world::{
    MockBrickState, MockFsTree, MockMotorState, MockSensorState, MockWorld, MockWorldHandle,
    ValueGenerator,
};
