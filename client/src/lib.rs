//! # Janken Client Library
//!
//! Console client for the rock-paper-scissors session server.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Owns the TCP connection. Login happens synchronously; afterwards a receive
//! thread and a send thread each work off their own [`shared::BoundedQueue`],
//! and a third thread forwards standard input as events.
//!
//! ### Game Module (`game`)
//! [`game::ClientState`] keeps the roster, pending invitations and the
//! current battle. It turns server messages and user commands into text to
//! print and messages to send, without doing any I/O itself.
//!
//! ### Commands Module (`commands`)
//! Parses console lines into [`commands::Command`]s.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::ClientState;
//! use client::network::{login, Connection};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut stream = Connection::connect("127.0.0.1:22502")?;
//! let (id, key) = login(&mut stream, "alice")?;
//! let mut state = ClientState::new(id, key, "alice");
//! let update = state.apply_command(client::commands::Command::Users);
//! for line in update.lines {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod game;
pub mod network;
