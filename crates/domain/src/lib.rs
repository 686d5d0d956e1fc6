//! Shared contract types for the Chorus conversational hub.
//!
//! Everything that crosses a component boundary lives here: chat
//! messages, tool specs and calls, streaming deltas, the audio frame
//! wire codec, the shared error type, and the configuration tree.

pub mod audio;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
