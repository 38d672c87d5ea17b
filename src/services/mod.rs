//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room state, ordering and session lifecycle so route
//! handlers can stay focused on protocol translation and auth plumbing.

pub mod auth;
pub mod fanout;
pub mod room;
pub mod sequencer;
pub mod snapshot;
pub mod supervisor;
