use clap::Parser;
use crossbeam_channel::{Receiver, Sender, bounded};
use sqlrelay_worker::codec::{
    DecodedCommand, Inbound, decode_command, encode_message, read_frame, write_frame,
};
use sqlrelay_worker::error::{ErrorKind, Failure};
use sqlrelay_worker::{WireCodec, WorkerConfig, WorkerMessage, WorkerRuntime};
use std::io::{self, BufWriter};
use std::thread;
use tracing::{debug, error, info, warn};

/// Embedded SQLite worker speaking length-prefixed frames on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "sqlrelay-worker")]
#[command(about = "Serves one in-memory SQLite database over stdio")]
struct Args {
    /// Accepted for launcher compatibility; stdio is the only transport.
    #[arg(long)]
    stdio: bool,

    /// Capacity of the command and response queues.
    #[arg(long)]
    max_queue: Option<usize>,

    /// Codec for the startup message (replies mirror each request's codec).
    #[arg(long)]
    codec: Option<WireCodec>,

    /// Wait for an explicit init command instead of initializing at startup.
    #[arg(long)]
    no_auto_init: bool,
}

impl Args {
    fn into_config(self) -> WorkerConfig {
        let mut config = WorkerConfig::from_env();
        if let Some(max_queue) = self.max_queue {
            config.max_queue = max_queue.max(1);
        }
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if self.no_auto_init {
            config.auto_initialize = false;
        }
        config
    }
}

type Outbound = (WireCodec, WorkerMessage);

fn main() -> io::Result<()> {
    // stdout carries frames; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = Args::parse().into_config();
    info!(
        max_queue = config.max_queue,
        auto_initialize = config.auto_initialize,
        codec = %config.codec,
        "starting sqlrelay worker"
    );

    let (command_tx, command_rx) = bounded::<(WireCodec, Inbound)>(config.max_queue);
    let (response_tx, response_rx) = bounded::<Outbound>(config.max_queue);

    let worker = {
        let config = config.clone();
        thread::Builder::new()
            .name("sqlrelay-worker".to_string())
            .spawn(move || worker_loop(WorkerRuntime::sqlite(), &config, command_rx, response_tx))?
    };
    let writer = thread::Builder::new()
        .name("sqlrelay-writer".to_string())
        .spawn(move || write_loop(response_rx))?;

    // Everything goes through the worker queue, rejections included, so
    // replies leave in the order their frames arrived. A full queue blocks
    // the reader; nothing is dropped.
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "failed to read command frame");
                let _ = command_tx.send((config.codec, rejected(Failure::malformed(err))));
                break;
            }
        };
        let queued = match decode_command(&frame) {
            Ok(DecodedCommand { inbound, wire }) => (wire, inbound),
            Err(err) => {
                warn!(error = %err, "undecodable command frame");
                (config.codec, rejected(Failure::malformed(err)))
            }
        };
        if command_tx.send(queued).is_err() {
            break;
        }
    }

    debug!("stdin closed; draining");
    drop(command_tx);
    if worker.join().is_err() {
        error!("worker thread panicked");
    }
    let _ = writer.join();
    Ok(())
}

fn rejected(failure: Failure) -> Inbound {
    Inbound::Rejected { id: None, failure }
}

fn worker_loop(
    mut runtime: WorkerRuntime,
    config: &WorkerConfig,
    command_rx: Receiver<(WireCodec, Inbound)>,
    response_tx: Sender<Outbound>,
) {
    if config.auto_initialize && response_tx.send((config.codec, runtime.startup())).is_err() {
        return;
    }
    while let Ok((wire, inbound)) = command_rx.recv() {
        let message = match inbound {
            Inbound::Envelope(envelope) => runtime.handle(envelope),
            Inbound::Rejected { id, failure } => {
                warn!(id = ?id, error = %failure.message, "rejecting command");
                WorkerMessage::Response {
                    id,
                    outcome: Err(failure),
                }
            }
        };
        if response_tx.send((wire, message)).is_err() {
            break;
        }
    }
}

fn write_loop(response_rx: Receiver<Outbound>) {
    let stdout = io::stdout();
    let mut writer = BufWriter::new(stdout.lock());
    while let Ok((wire, message)) = response_rx.recv() {
        let encoded = match encode_message(&message, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "failed to encode response");
                let fallback = WorkerMessage::Response {
                    id: message.id().cloned(),
                    outcome: Err(Failure::new(ErrorKind::EngineError, err.to_string())),
                };
                match encode_message(&fallback, wire) {
                    Ok(encoded) => encoded,
                    Err(_) => continue,
                }
            }
        };
        if let Err(err) = write_frame(&mut writer, &encoded) {
            error!(error = %err, "failed to write response");
            break;
        }
    }
}
