//! Transports carrying commands from a controller to one worker.
//!
//! A link only moves commands forward; worker messages come back on the
//! crossbeam receiver handed out next to it.

use crate::codec::{
    WireCodec, decode_message, encode_command, peek_id, read_frame, write_frame,
};
use crate::error::{ControllerError, ErrorKind, Failure};
use crate::protocol::{Envelope, WorkerMessage};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::ffi::OsStr;
use std::io::{self, BufReader, BufWriter, Read};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

pub trait Link: Send {
    fn send(&mut self, envelope: Envelope) -> Result<(), ControllerError>;

    /// Stops accepting commands and waits for the worker to finish.
    fn close(&mut self) -> Result<(), ControllerError>;
}

/// A worker running on a thread of this process.
pub struct ThreadLink {
    commands: Option<Sender<Envelope>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadLink {
    pub fn new(commands: Sender<Envelope>, thread: JoinHandle<()>) -> Self {
        Self {
            commands: Some(commands),
            thread: Some(thread),
        }
    }
}

impl Link for ThreadLink {
    fn send(&mut self, envelope: Envelope) -> Result<(), ControllerError> {
        let commands = self.commands.as_ref().ok_or(ControllerError::ChannelClosed)?;
        commands
            .send(envelope)
            .map_err(|_| ControllerError::ChannelClosed)
    }

    fn close(&mut self) -> Result<(), ControllerError> {
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ThreadLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A worker running as a child process speaking framed messages over
/// stdin/stdout.
pub struct ProcessLink {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    codec: WireCodec,
    reader: Option<JoinHandle<()>>,
}

impl ProcessLink {
    pub fn spawn<I, S>(
        program: impl AsRef<OsStr>,
        args: I,
        codec: WireCodec,
        capacity: usize,
    ) -> Result<(Self, Receiver<WorkerMessage>), ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout unavailable"))?;

        let (tx, rx) = bounded::<WorkerMessage>(capacity.max(1));
        let reader = thread::Builder::new()
            .name("sqlrelay-link-reader".to_string())
            .spawn(move || pump_messages(BufReader::new(stdout), tx))?;

        Ok((
            Self {
                child,
                stdin: Some(BufWriter::new(stdin)),
                codec,
                reader: Some(reader),
            },
            rx,
        ))
    }
}

/// Forwards decoded worker frames until the stream ends.
///
/// A frame that does not decode still resolves its waiter when its id can be
/// read. Without an id nobody can be answered, so the stream is treated as
/// broken and the receiver is closed, which releases every waiter.
fn pump_messages<R: Read>(mut reader: R, tx: Sender<WorkerMessage>) {
    loop {
        let frame = match read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read worker frame");
                break;
            }
        };
        let message = match decode_message(&frame) {
            Ok((message, _)) => message,
            Err(err) => match peek_id(&frame) {
                Some(id) => {
                    warn!(%id, error = %err, "undecodable worker reply");
                    WorkerMessage::Response {
                        id: Some(id),
                        outcome: Err(Failure::new(
                            ErrorKind::EngineError,
                            format!("undecodable worker reply: {err}"),
                        )),
                    }
                }
                None => {
                    error!(error = %err, "undecodable worker frame without id; closing link");
                    break;
                }
            },
        };
        if tx.send(message).is_err() {
            break;
        }
    }
    debug!("worker stdout closed");
}

impl Link for ProcessLink {
    fn send(&mut self, envelope: Envelope) -> Result<(), ControllerError> {
        let stdin = self.stdin.as_mut().ok_or(ControllerError::ChannelClosed)?;
        let payload = encode_command(&envelope, self.codec)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        write_frame(stdin, &payload).map_err(|err| match err.kind() {
            io::ErrorKind::BrokenPipe => ControllerError::ChannelClosed,
            _ => ControllerError::Io(err),
        })
    }

    fn close(&mut self) -> Result<(), ControllerError> {
        // EOF on stdin is the worker's signal to finish and exit.
        self.stdin.take();
        let status = self.child.wait()?;
        debug!(%status, "worker process exited");
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("worker reader thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ProcessLink {
    fn drop(&mut self) {
        if self.stdin.is_some() || self.reader.is_some() {
            let _ = self.close();
        }
    }
}
