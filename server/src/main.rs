use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};
use shared::cli::{init_logging, parse_or_exit, CommonArgs};

/// Rock-paper-scissors session server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to listen on
    #[arg(default_value = "0.0.0.0")]
    address: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Args = parse_or_exit();
    init_logging(args.common.loglevel);

    info!("Starting server on {}:{}", args.address, args.common.port);
    let server = Server::bind(
        (args.address.as_str(), args.common.port),
        ServerConfig::default(),
    )?;
    server.run()?;

    Ok(())
}
