//! # Janken Server Library
//!
//! Session server for multiplayer rock-paper-scissors. Clients join under a
//! nickname, see who else is online, challenge each other and fight turn-based
//! battles until one side runs out of hit points.
//!
//! ## Architecture
//!
//! ### Threads
//! - The main thread accepts TCP connections forever.
//! - Each accepted connection gets one receiver thread that decodes messages
//!   and pushes them onto the incoming queue.
//! - A single dispatcher thread takes entries off that queue and applies them.
//!
//! The incoming [`shared::BoundedQueue`] is the only state touched by more than
//! one thread. Sessions and challenges belong to the dispatcher alone, and
//! replies are written synchronously from the dispatcher thread.
//!
//! ### Modules
//! - [`network`]: listener, receiver threads, queue entries and the
//!   [`network::Outbound`] seam the dispatcher writes through
//! - [`registry`]: sessions indexed by id, connection and nickname
//! - [`challenge`]: invitations, battles and turn resolution
//! - [`dispatcher`]: per-message handlers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! fn main() -> std::io::Result<()> {
//!     let server = Server::bind(("0.0.0.0", 22502), ServerConfig::default())?;
//!     server.run()
//! }
//! ```

pub mod challenge;
pub mod dispatcher;
pub mod network;
pub mod registry;
