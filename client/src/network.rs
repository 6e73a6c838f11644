//! Connection to the server
//!
//! After login the socket is split between two threads. The receive thread
//! decodes server messages into the event queue; the send thread drains the
//! outgoing queue onto the socket. The interactive thread only touches the
//! two queues.

use log::{debug, info, warn};
use shared::protocol::{read_message, recv_message, write_message};
use shared::{BoundedQueue, ErrorCode, Message, ProtocolError};
use std::io::{self, BufRead};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Capacity of the client's event and outgoing queues
pub const QUEUE_CAPACITY: usize = 4096;

/// Everything the interactive thread reacts to
#[derive(Debug)]
pub enum Event {
    Received(Message),
    Disconnected { reason: String },
    Input(String),
    /// Standard input reached end of file
    InputClosed,
}

#[derive(Debug)]
enum Outgoing {
    Message(Message),
    Close,
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("server refused the nickname: {}", .0.description())]
    Refused(ErrorCode),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Sends Join and waits for the matching reply; returns (id, key)
pub fn login(stream: &mut TcpStream, nickname: &str) -> Result<(u16, u32), LoginError> {
    write_message(
        stream,
        &Message::Join {
            nickname: nickname.to_string(),
        },
    )?;
    loop {
        match read_message(stream)? {
            Message::JoinReply {
                error: ErrorCode::Ok,
                id,
                key,
                ..
            } => return Ok((id, key)),
            Message::JoinReply { error, .. } => return Err(LoginError::Refused(error)),
            other => debug!("Skipped {:?} while logging in", other.kind()),
        }
    }
}

pub struct Connection {
    stream: TcpStream,
    outgoing: Arc<BoundedQueue<Outgoing>>,
    receiver: Option<JoinHandle<()>>,
    sender: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(addr)?;
        info!("Connected to {}", stream.peer_addr()?);
        Ok(stream)
    }

    /// Starts the receive and send threads; received messages and
    /// disconnects are pushed onto `events`
    pub fn start(stream: TcpStream, events: Arc<BoundedQueue<Event>>) -> io::Result<Self> {
        let outgoing = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));

        let reader = stream.try_clone()?;
        let receiver = thread::Builder::new()
            .name("recv".to_string())
            .spawn(move || receive_loop(reader, events))?;

        let mut writer = stream.try_clone()?;
        let queue = Arc::clone(&outgoing);
        let sender = thread::Builder::new()
            .name("send".to_string())
            .spawn(move || send_loop(&mut writer, &queue))?;

        Ok(Self {
            stream,
            outgoing,
            receiver: Some(receiver),
            sender: Some(sender),
        })
    }

    /// Queues a message for the send thread
    pub fn send(&self, message: Message) {
        if self.outgoing.add(Outgoing::Message(message), true).is_err() {
            warn!("Outgoing queue rejected a message");
        }
    }

    /// Flushes queued messages, then tears the socket down and joins both
    /// threads
    pub fn close(mut self) {
        let _ = self.outgoing.add(Outgoing::Close, true);
        if let Some(sender) = self.sender.take() {
            let _ = sender.join();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        debug!("Connection closed");
    }
}

fn receive_loop(stream: TcpStream, events: Arc<BoundedQueue<Event>>) {
    let reason = loop {
        match recv_message(&stream, true) {
            Ok(message) => {
                if events.add(Event::Received(message), true).is_err() {
                    break "event queue failed".to_string();
                }
            }
            Err(ProtocolError::WouldBlock) => continue,
            Err(ProtocolError::Closed) => break "server closed the connection".to_string(),
            Err(e) => break e.to_string(),
        }
    };
    info!("Receive thread stopping: {}", reason);
    let _ = events.add(Event::Disconnected { reason }, true);
}

fn send_loop(stream: &mut TcpStream, queue: &BoundedQueue<Outgoing>) {
    while let Ok(Outgoing::Message(message)) = queue.take(true) {
        if let Err(e) = write_message(stream, &message) {
            warn!("Failed to send {:?}: {}", message.kind(), e);
            break;
        }
    }
}

/// Forwards standard input line by line onto `events`
pub fn spawn_input_reader(events: Arc<BoundedQueue<Event>>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("stdin".to_string()).spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if events.add(Event::Input(line), true).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    break;
                }
            }
        }
        let _ = events.add(Event::InputClosed, true);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn test_login_skips_to_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let handle = thread::spawn(move || {
            assert_eq!(
                read_message(&mut server).unwrap(),
                Message::Join {
                    nickname: "alice".to_string()
                }
            );
            write_message(&mut server, &Message::UserChangeBatch { users: vec![] }).unwrap();
            write_message(
                &mut server,
                &Message::JoinReply {
                    nickname: "alice".to_string(),
                    error: ErrorCode::Ok,
                    id: 5,
                    key: 99,
                },
            )
            .unwrap();
            server
        });

        assert_eq!(login(&mut client, "alice").unwrap(), (5, 99));
        handle.join().unwrap();
    }

    #[test]
    fn test_login_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let handle = thread::spawn(move || {
            read_message(&mut server).unwrap();
            write_message(
                &mut server,
                &Message::JoinReply {
                    nickname: "x y".to_string(),
                    error: ErrorCode::IllegalNickname,
                    id: 0,
                    key: 0,
                },
            )
            .unwrap();
            server
        });

        match login(&mut client, "x y") {
            Err(LoginError::Refused(code)) => assert_eq!(code, ErrorCode::IllegalNickname),
            other => panic!("unexpected {:?}", other),
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_connection_threads() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = Connection::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let events = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));
        let connection = Connection::start(client, Arc::clone(&events)).unwrap();

        let text = Message::SendText {
            id: 1,
            key: 0,
            text: "hello".to_string(),
        };
        write_message(&mut server, &text).unwrap();
        match events.take(true).unwrap() {
            Event::Received(message) => assert_eq!(message, text),
            other => panic!("unexpected {:?}", other),
        }

        connection.send(Message::Quit { key: 7, id: 1 });
        assert_eq!(
            read_message(&mut server).unwrap(),
            Message::Quit { key: 7, id: 1 }
        );

        connection.close();
        assert!(matches!(
            events.take(true).unwrap(),
            Event::Disconnected { .. }
        ));
    }
}
