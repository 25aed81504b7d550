#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
#[macro_use]
mod fmt;

pub mod config;
pub mod error;
pub mod state;
pub mod sdk;
pub mod hci;
pub mod engine;
pub mod sequencer;

pub use config::{EngineConfig, OperatingMode, Platform};
pub use engine::ProdTestEngine;
pub use error::Error;
pub use hci::command::Command;
pub use hci::event::Event;
pub use sdk::hal::ProdTestHal;
pub use state::{SharedState, TestState};
