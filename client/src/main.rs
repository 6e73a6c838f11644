use clap::Parser;
use client::commands::parse;
use client::game::{ClientState, Update};
use client::network::{login, spawn_input_reader, Connection, Event, LoginError, QUEUE_CAPACITY};
use log::{debug, info};
use shared::cli::{init_logging, parse_or_exit, CommonArgs};
use shared::BoundedQueue;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Console client for the rock-paper-scissors server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server address to connect to
    #[arg(default_value = "127.0.0.1")]
    address: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn prompt(text: &str) -> io::Result<Option<String>> {
    print!("{}", text);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}

fn show(update: &Update, connection: &Connection) {
    for line in &update.lines {
        println!("{}", line);
    }
    for message in &update.outgoing {
        connection.send(message.clone());
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = parse_or_exit();
    init_logging(args.common.loglevel);

    info!("Connecting to {}:{}", args.address, args.common.port);
    let mut stream = Connection::connect((args.address.as_str(), args.common.port))?;

    let (nickname, id, key) = loop {
        let nickname = match prompt("Nickname: ")? {
            Some(nickname) => nickname,
            None => return Ok(()),
        };
        match login(&mut stream, &nickname) {
            Ok((id, key)) => break (nickname, id, key),
            Err(LoginError::Refused(code)) => println!("{}", code.description()),
            Err(e) => return Err(e.into()),
        }
    };
    println!("Welcome, {}! Type /help for commands.", nickname);

    let events = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));
    let connection = Connection::start(stream, Arc::clone(&events))?;
    spawn_input_reader(Arc::clone(&events))?;

    let mut state = ClientState::new(id, key, &nickname);
    while let Ok(event) = events.take(true) {
        let update = match event {
            Event::Received(message) => state.apply_message(message),
            Event::Input(line) => match parse(&line) {
                Ok(Some(command)) => state.apply_command(command),
                Ok(None) => continue,
                Err(e) => {
                    println!("{}", e);
                    continue;
                }
            },
            Event::InputClosed => {
                debug!("Input closed");
                connection.send(state.quit_message());
                break;
            }
            Event::Disconnected { reason } => {
                println!("Disconnected: {}", reason);
                break;
            }
        };
        show(&update, &connection);
        if update.exit {
            break;
        }
    }

    connection.close();
    Ok(())
}
