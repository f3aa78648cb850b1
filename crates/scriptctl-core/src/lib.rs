//! scriptctl core - platform-independent pieces of the script manager
//!
//! Configuration, error types, script discovery, output events and the
//! process traits that the platform crates implement.

pub mod config;
pub mod error;
pub mod event;
pub mod process;
pub mod script;
pub mod stdio;

pub use config::*;
pub use error::*;
pub use event::*;
pub use process::*;
pub use script::*;
