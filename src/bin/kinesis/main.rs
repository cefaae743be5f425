//! Command line tool for inspecting the contents of a Kinesis stream.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod consume;

use consume::{ConsumeArgs, ConsumeMode};

#[derive(Parser, Debug)]
#[command(name = "kinesis")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Display the contents of a Kinesis stream on standard output")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Display the stream starting at the oldest retained record.
    Head(ConsumeArgs),
    /// Display the stream starting at the latest record.
    Tail(ConsumeArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Head(args) => consume::run(args, ConsumeMode::Head).await,
        Command::Tail(args) => consume::run(args, ConsumeMode::Tail).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("kinesis: {err}");
            ExitCode::FAILURE
        }
    }
}
