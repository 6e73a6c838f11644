//! Connection handling: accept loop, per-connection receiver threads, and
//! the outbound side the dispatcher writes replies through

use crate::dispatcher::Dispatcher;
use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::protocol::{recv_message, write_message};
use shared::{BoundedQueue, Message, ProtocolError};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Maximum number of sessions joined at once
pub const MAX_USERS: usize = 1024;
/// Capacity of the dispatcher's incoming queue
pub const INCOMING_QUEUE_CAPACITY: usize = 65536;

/// Server-assigned handle for one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work items flowing from the network threads to the dispatcher
#[derive(Debug)]
pub enum QueueEntry {
    /// A connection was accepted; carries the write half for replies
    Connected {
        connection: ConnectionId,
        stream: TcpStream,
    },
    /// A complete, validated message arrived on `connection`
    Message {
        connection: ConnectionId,
        message: Message,
    },
    /// The receiver for `connection` stopped; the peer is gone
    Disconnected { connection: ConnectionId },
}

/// Where the dispatcher's replies and broadcasts go.
///
/// Sends are synchronous: a slow peer stalls the caller.
pub trait Outbound {
    fn attach(&mut self, connection: ConnectionId, stream: TcpStream);
    /// Forgets `connection` and shuts its socket down
    fn detach(&mut self, connection: ConnectionId);
    /// Writes one message. A connection whose write fails is detached.
    fn send(&mut self, to: ConnectionId, message: &Message) -> Result<(), ProtocolError>;
}

/// Write halves of every live connection, owned by the dispatcher
#[derive(Default)]
pub struct Connections {
    streams: HashMap<ConnectionId, TcpStream>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Outbound for Connections {
    fn attach(&mut self, connection: ConnectionId, stream: TcpStream) {
        self.streams.insert(connection, stream);
    }

    fn detach(&mut self, connection: ConnectionId) {
        if let Some(stream) = self.streams.remove(&connection) {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("Closed connection {}", connection);
        }
    }

    fn send(&mut self, to: ConnectionId, message: &Message) -> Result<(), ProtocolError> {
        let stream = self.streams.get_mut(&to).ok_or_else(|| {
            ProtocolError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection {} is not attached", to),
            ))
        })?;
        trace!("-> {} {:?}", to, message.kind());
        let result = write_message(stream, message);
        // A failed or partial write leaves the peer mid-frame, so the
        // connection is closed. Its receiver then reports the disconnect.
        if let Err(e) = &result {
            warn!("Send of {:?} to {} failed: {}", message.kind(), to, e);
            self.detach(to);
        }
        result
    }
}

/// Everything a receiver thread owns
struct Receiver {
    connection: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    queue: Arc<BoundedQueue<QueueEntry>>,
}

impl Receiver {
    fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("recv-{}", self.connection.0))
            .spawn(move || self.run())
    }

    fn run(self) {
        info!("Accepted connection {} from {}", self.connection, self.peer);
        loop {
            match recv_message(&self.stream, true) {
                Ok(message) => {
                    debug!("Received {:?} on {}", message.kind(), self.connection);
                    let entry = QueueEntry::Message {
                        connection: self.connection,
                        message,
                    };
                    if self.queue.add(entry, true).is_err() {
                        break;
                    }
                }
                Err(ProtocolError::WouldBlock) => continue,
                Err(ProtocolError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ProtocolError::Closed) => break,
                Err(e) => {
                    warn!(
                        "Corrupted packet from {} ({}); shutting down: {}",
                        self.peer, self.connection, e
                    );
                    break;
                }
            }
        }

        info!("Disconnected from {} ({})", self.peer, self.connection);
        let _ = self.queue.add(
            QueueEntry::Disconnected {
                connection: self.connection,
            },
            true,
        );
    }
}

/// Tunables for a server instance
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_users: usize,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_users: MAX_USERS,
            queue_capacity: INCOMING_QUEUE_CAPACITY,
        }
    }
}

/// Listening server: one receiver thread per connection feeding a single
/// dispatcher thread through the incoming queue
pub struct Server {
    listener: TcpListener,
    queue: Arc<BoundedQueue<QueueEntry>>,
    config: ServerConfig,
    next_connection: u64,
}

impl Server {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: ServerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!("Listening at {}", listener.local_addr()?);
        Ok(Self {
            listener,
            queue: Arc::new(BoundedQueue::new(config.queue_capacity)),
            config,
            next_connection: 1,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the dispatcher thread over the incoming queue
    pub fn spawn_dispatcher(&self) -> io::Result<JoinHandle<()>> {
        let queue = Arc::clone(&self.queue);
        let max_users = self.config.max_users;
        thread::Builder::new()
            .name("dispatcher".to_string())
            .spawn(move || {
                let dispatcher = Dispatcher::new(Connections::new(), StdRng::from_entropy(), max_users);
                dispatcher.run(&queue);
            })
    }

    /// Accepts connections forever
    pub fn run(mut self) -> io::Result<()> {
        self.spawn_dispatcher()?;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.accept(stream, peer) {
                        error!("Failed to set up connection from {}: {}", peer, e);
                    }
                }
                Err(e) => warn!("accept() failed: {}", e),
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let writer = stream.try_clone()?;
        // Registered before the receiver starts so the dispatcher always
        // knows the connection before its first message.
        let _ = self.queue.add(
            QueueEntry::Connected {
                connection,
                stream: writer,
            },
            true,
        );

        let receiver = Receiver {
            connection,
            peer,
            stream,
            queue: Arc::clone(&self.queue),
        };
        if let Err(e) = receiver.spawn() {
            let _ = self
                .queue
                .add(QueueEntry::Disconnected { connection }, true);
            return Err(e);
        }
        Ok(())
    }
}
