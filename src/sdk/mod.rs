pub mod common;
pub mod gpio;
pub mod hal;
pub mod pm;
pub mod rf;
pub mod timer;
