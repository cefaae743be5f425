//! Shared implementation of the `head` and `tail` subcommands: build a
//! consumer over the in-memory checkpoint store, print every record to
//! stdout and stop after `--number` records when asked to.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use clap::Args;
use flate2::read::GzDecoder;
use tracing::{debug, error, info};

use kinesis_consumer::{
    AwsConfig, Consumer, ConsumerConfig, ConsumerOptions, LogLevel, Logger, MemoryCheckpoint,
    Message, MessageHandler, Result, Supervisor,
};

#[derive(Args, Debug)]
pub struct ConsumeArgs {
    /// Stream name.
    #[arg(short = 's', long, default_value = "")]
    pub stream: String,

    /// Kinesis endpoint, e.g. a localstack URL.
    #[arg(short = 'e', long, default_value = "")]
    pub endpoint: String,

    /// AWS region; defaults to the region from the AWS config.
    #[arg(short = 'r', long, default_value = "")]
    pub region: String,

    /// Number of messages to show; 0 means no limit.
    #[arg(short = 'n', long, default_value_t = 0)]
    pub number: u64,

    /// Enable logging, mute by default.
    #[arg(long)]
    pub logging: bool,

    /// Gunzip each record body before printing it.
    #[arg(long)]
    pub gzip: bool,

    /// Do not wait for parent shards to drain before reading children.
    #[arg(long)]
    pub skip_resharding_order: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum ConsumeMode {
    Head,
    Tail,
}

impl ConsumeMode {
    fn group(self) -> &'static str {
        match self {
            ConsumeMode::Head => "head",
            ConsumeMode::Tail => "tail",
        }
    }

    fn apply_position(self, options: ConsumerOptions) -> ConsumerOptions {
        match self {
            ConsumeMode::Head => options.since_oldest(),
            ConsumeMode::Tail => options.since_latest(),
        }
    }
}

pub async fn run(args: ConsumeArgs, mode: ConsumeMode) -> Result<()> {
    let supervisor = Arc::new(Supervisor::new());

    let mut options = mode.apply_position(ConsumerOptions::default());
    if args.skip_resharding_order {
        options = options.skip_resharding_order();
    }
    if args.logging {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_writer(io::stderr)
            .init();
        options = options.with_logger(tracing_logger());
    }

    let config = ConsumerConfig {
        group: mode.group().to_owned(),
        stream: args.stream.clone(),
        aws: AwsConfig {
            endpoint: args.endpoint.clone(),
            region: args.region.clone(),
        },
    };

    let handler = print_handler(supervisor.clone(), args.number, args.gzip);
    let consumer = Arc::new(Consumer::new(
        config,
        handler,
        Arc::new(MemoryCheckpoint::new()),
        options,
    )?);

    {
        let consumer = consumer.clone();
        supervisor.add_runner(format!("kinesis-{}", mode.group()), move |signal| async move {
            consumer.run(signal).await
        });
    }

    supervisor.start().await
}

/// Prints each record body on its own line through a buffered writer,
/// inflating gzip bodies when asked to, and shuts the supervisor down
/// once `limit` records have been shown.
fn print_handler(supervisor: Arc<Supervisor>, limit: u64, gzip: bool) -> MessageHandler {
    let shown = Arc::new(AtomicU64::new(0));
    let out = Arc::new(Mutex::new(io::BufWriter::new(io::stdout())));
    Arc::new(move |message: Message| {
        if limit != 0 && shown.load(Ordering::SeqCst) >= limit {
            supervisor.shutdown();
            return Ok(());
        }

        let body = if gzip {
            inflate(&message.data)?
        } else {
            message.data.to_vec()
        };

        let mut out = out.lock().expect("stdout writer lock");
        out.write_all(&body)?;
        out.write_all(b"\n")?;
        out.flush()?;

        shown.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn inflate(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    GzDecoder::new(data).read_to_end(&mut body)?;
    Ok(body)
}

/// Bridge the consumer's logger callback onto `tracing`.
fn tracing_logger() -> Logger {
    Arc::new(|level, fields, message| {
        let context = fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            LogLevel::Debug => debug!(target: "kinesis", "{message} {context}"),
            LogLevel::Info => info!(target: "kinesis", "{message} {context}"),
            LogLevel::Error => error!(target: "kinesis", "{message} {context}"),
        }
    })
}
