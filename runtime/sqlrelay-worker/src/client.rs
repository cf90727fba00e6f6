//! The controller: hands out request ids, forwards commands over a [`Link`]
//! and resolves each caller when the response carrying its id comes back.

use crate::config::{ClientConfig, WorkerConfig};
use crate::error::{ControllerError, Failure};
use crate::link::{Link, ProcessLink, ThreadLink};
use crate::protocol::{Command, Envelope, Reply, RequestId, WorkerMessage};
use crate::runtime::WorkerRuntime;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use sqlrelay_db::{QueryOutput, Value};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

type Waiter = oneshot::Sender<Result<Reply, Failure>>;
type StartupState = Option<Result<(), Failure>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<RequestId, Waiter>,
    closed: bool,
}

pub struct Controller {
    link: Mutex<Box<dyn Link>>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    startup: watch::Receiver<StartupState>,
    request_timeout: Option<Duration>,
    router: Option<JoinHandle<()>>,
}

impl Controller {
    /// Wraps an established link. `messages` must yield everything the
    /// worker behind `link` emits.
    pub fn connect(
        link: impl Link + 'static,
        messages: Receiver<WorkerMessage>,
        config: &ClientConfig,
    ) -> Result<Self, ControllerError> {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let (startup_tx, startup_rx) = watch::channel(None);
        let router = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("sqlrelay-router".to_string())
                .spawn(move || route(messages, pending, startup_tx))?
        };
        Ok(Self {
            link: Mutex::new(Box::new(link)),
            pending,
            next_id: AtomicU64::new(1),
            startup: startup_rx,
            request_timeout: config.request_timeout,
            router: Some(router),
        })
    }

    /// Starts a SQLite worker on a thread of this process.
    pub fn in_process(worker: &WorkerConfig, client: &ClientConfig) -> Result<Self, ControllerError> {
        Self::with_runtime(WorkerRuntime::sqlite(), worker, client)
    }

    pub fn with_runtime(
        runtime: WorkerRuntime,
        worker: &WorkerConfig,
        client: &ClientConfig,
    ) -> Result<Self, ControllerError> {
        let handle = runtime.spawn(worker)?;
        let link = ThreadLink::new(handle.commands, handle.thread);
        Self::connect(link, handle.messages, client)
    }

    /// Starts `program` as a child process speaking the framed protocol on
    /// stdin/stdout.
    pub fn spawn_process<I, S>(
        program: impl AsRef<OsStr>,
        args: I,
        config: &ClientConfig,
    ) -> Result<Self, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (link, messages) = ProcessLink::spawn(program, args, config.codec, config.max_queue)?;
        Self::connect(link, messages, config)
    }

    /// Sends one command and waits for the response carrying its id.
    ///
    /// Handing the command to the link is synchronous and blocks while the
    /// worker's queue is full; see [`ClientConfig::max_queue`]. Only the wait
    /// for the response yields.
    pub async fn send(&self, command: Command) -> Result<Reply, ControllerError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            // Ids are taken under the link lock so the worker sees them in
            // increasing order.
            let mut link = self.link.lock();
            let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
            {
                let mut pending = self.pending.lock();
                if pending.closed {
                    return Err(ControllerError::ChannelClosed);
                }
                pending.waiters.insert(id.clone(), tx);
            }
            debug!(%id, command = command.name(), "sending command");
            if let Err(err) = link.send(Envelope {
                id: Some(id.clone()),
                command,
            }) {
                self.pending.lock().waiters.remove(&id);
                return Err(err);
            }
            id
        };

        let received = match self.request_timeout {
            Some(limit) => match timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().waiters.remove(&id);
                    warn!(%id, "request timed out");
                    return Err(ControllerError::Timeout {
                        id,
                        millis: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        let outcome = received.map_err(|_| ControllerError::ChannelClosed)?;
        Ok(outcome?)
    }

    pub async fn initialize(&self) -> Result<(), ControllerError> {
        match self.send(Command::Initialize).await? {
            Reply::Initialized => Ok(()),
            other => Err(unexpected("init", &other)),
        }
    }

    pub async fn execute(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<QueryOutput, ControllerError> {
        match self.send(Command::execute(sql, params)).await? {
            Reply::Rows(output) => Ok(output),
            other => Err(unexpected("exec", &other)),
        }
    }

    pub async fn export_snapshot(&self) -> Result<Vec<u8>, ControllerError> {
        match self.send(Command::ExportSnapshot).await? {
            Reply::Snapshot(bytes) => Ok(bytes),
            other => Err(unexpected("export", &other)),
        }
    }

    pub async fn import_snapshot(&self, data: Vec<u8>) -> Result<(), ControllerError> {
        match self.send(Command::ImportSnapshot { data }).await? {
            Reply::Imported => Ok(()),
            other => Err(unexpected("import", &other)),
        }
    }

    /// Resolves once the worker has reported a successful initialize, either
    /// its own at startup or one requested through [`Controller::initialize`].
    /// A failed startup resolves with that failure.
    pub async fn wait_ready(&self) -> Result<(), ControllerError> {
        let mut startup = self.startup.clone();
        let state = startup
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ControllerError::ChannelClosed)?;
        match &*state {
            Some(Ok(())) => Ok(()),
            Some(Err(failure)) => Err(ControllerError::Worker(failure.clone())),
            None => Err(ControllerError::ChannelClosed),
        }
    }

    /// Requests sent but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().waiters.len()
    }

    /// Closes the link, waits for the worker to exit and for every
    /// outstanding caller to be released.
    pub fn shutdown(mut self) -> Result<(), ControllerError> {
        let closed = self.link.lock().close();
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                warn!("response router panicked");
            }
        }
        info!("controller shut down");
        closed
    }
}

fn unexpected(command: &'static str, reply: &Reply) -> ControllerError {
    ControllerError::UnexpectedReply {
        command,
        reply: reply.name(),
    }
}

fn route(
    messages: Receiver<WorkerMessage>,
    pending: Arc<Mutex<Pending>>,
    startup: watch::Sender<StartupState>,
) {
    for message in messages.iter() {
        let (id, outcome) = match message {
            WorkerMessage::Init { id: None, outcome } => {
                match &outcome {
                    Ok(()) => info!("worker ready"),
                    Err(failure) => warn!(kind = %failure.kind, error = %failure.message, "worker startup failed"),
                }
                startup.send_replace(Some(outcome));
                continue;
            }
            WorkerMessage::Init {
                id: Some(id),
                outcome,
            } => {
                if outcome.is_ok() {
                    startup.send_replace(Some(Ok(())));
                }
                (id, outcome.map(|()| Reply::Initialized))
            }
            WorkerMessage::Response { id: Some(id), outcome } => (id, outcome),
            WorkerMessage::Response { id: None, outcome } => {
                warn!(success = outcome.is_ok(), "discarding uncorrelated response");
                continue;
            }
        };
        let waiter = pending.lock().waiters.remove(&id);
        match waiter {
            Some(waiter) => {
                // The caller may have given up already.
                let _ = waiter.send(outcome);
            }
            None => debug!(%id, "discarding response with no pending request"),
        }
    }

    let mut pending = pending.lock();
    pending.closed = true;
    if !pending.waiters.is_empty() {
        warn!(count = pending.waiters.len(), "worker gone with requests in flight");
    }
    pending.waiters.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crossbeam_channel::{Sender, unbounded};
    use tokio::task::yield_now;

    /// Link that records what it is given and never answers by itself.
    struct RecordingLink {
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    impl Link for RecordingLink {
        fn send(&mut self, envelope: Envelope) -> Result<(), ControllerError> {
            self.sent.lock().push(envelope);
            Ok(())
        }

        fn close(&mut self) -> Result<(), ControllerError> {
            Ok(())
        }
    }

    fn recording(
        config: &ClientConfig,
    ) -> (Controller, Arc<Mutex<Vec<Envelope>>>, Sender<WorkerMessage>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded();
        let controller = Controller::connect(
            RecordingLink {
                sent: Arc::clone(&sent),
            },
            rx,
            config,
        )
        .expect("connect");
        (controller, sent, tx)
    }

    async fn wait_for_sent(sent: &Mutex<Vec<Envelope>>, count: usize) {
        while sent.lock().len() < count {
            yield_now().await;
        }
    }

    fn rows_of(value: i64) -> Reply {
        Reply::Rows(QueryOutput {
            results: vec![sqlrelay_db::ResultSet {
                columns: vec!["x".into()],
                values: vec![vec![Value::Integer(value)]],
            }],
            changes: 0,
            last_insert_rowid: 0,
        })
    }

    fn in_process() -> Controller {
        Controller::in_process(&WorkerConfig::default(), &ClientConfig::default())
            .expect("controller")
    }

    #[tokio::test]
    async fn back_to_back_requests_get_increasing_ids_and_correct_replies() {
        let (controller, sent, worker) = recording(&ClientConfig::default());

        let (first, second, ()) = tokio::join!(
            controller.execute("SELECT 1", Vec::new()),
            controller.execute("SELECT 2", Vec::new()),
            async {
                wait_for_sent(&sent, 2).await;
                // Answer out of order.
                for (id, value) in [(2u64, 2), (1u64, 1)] {
                    worker
                        .send(WorkerMessage::Response {
                            id: Some(RequestId::Number(id)),
                            outcome: Ok(rows_of(value)),
                        })
                        .expect("reply");
                }
            }
        );

        let ids: Vec<_> = sent.lock().iter().map(|env| env.id.clone()).collect();
        assert_eq!(
            ids,
            vec![Some(RequestId::Number(1)), Some(RequestId::Number(2))]
        );
        assert_eq!(first.expect("first").rows(), &[vec![Value::Integer(1)]]);
        assert_eq!(second.expect("second").rows(), &[vec![Value::Integer(2)]]);
        assert_eq!(controller.pending_requests(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_discarded() {
        let (controller, sent, worker) = recording(&ClientConfig::default());
        let (reply, ()) = tokio::join!(controller.export_snapshot(), async {
            wait_for_sent(&sent, 1).await;
            for id in [RequestId::from("stray"), RequestId::Number(1)] {
                worker
                    .send(WorkerMessage::Response {
                        id: Some(id),
                        outcome: Ok(Reply::Snapshot(vec![7])),
                    })
                    .expect("reply");
            }
        });
        assert_eq!(reply.expect("snapshot"), vec![7]);
    }

    #[tokio::test]
    async fn silent_worker_times_out_and_forgets_the_request() {
        let config = ClientConfig::default().with_timeout(Duration::from_millis(50));
        let (controller, _sent, _worker) = recording(&config);

        let err = controller
            .execute("SELECT 1", Vec::new())
            .await
            .expect_err("timeout");
        match err {
            ControllerError::Timeout { id, millis } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(millis, 50);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(controller.pending_requests(), 0);
    }

    #[tokio::test]
    async fn worker_exit_releases_waiters() {
        let (controller, sent, worker) = recording(&ClientConfig::default());
        let (outcome, ()) = tokio::join!(controller.initialize(), async move {
            wait_for_sent(&sent, 1).await;
            drop(worker);
        });
        assert!(matches!(outcome, Err(ControllerError::ChannelClosed)));

        while !controller.pending.lock().closed {
            yield_now().await;
        }
        assert!(matches!(
            controller.initialize().await,
            Err(ControllerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn wrong_reply_shape_is_reported() {
        let (controller, sent, worker) = recording(&ClientConfig::default());
        let (outcome, ()) = tokio::join!(controller.import_snapshot(Vec::new()), async {
            wait_for_sent(&sent, 1).await;
            worker
                .send(WorkerMessage::Response {
                    id: Some(RequestId::Number(1)),
                    outcome: Ok(Reply::Snapshot(Vec::new())),
                })
                .expect("reply");
        });
        assert!(matches!(
            outcome,
            Err(ControllerError::UnexpectedReply {
                command: "import",
                reply: "snapshot"
            })
        ));
    }

    #[tokio::test]
    async fn in_process_worker_runs_statements_in_order() {
        let controller = in_process();
        controller.wait_ready().await.expect("ready");
        controller
            .execute("CREATE TABLE t(x INTEGER)", Vec::new())
            .await
            .expect("create");

        let (insert, update) = tokio::join!(
            controller.execute("INSERT INTO t VALUES (?)", vec![Value::Integer(1)]),
            controller.execute("UPDATE t SET x = x + 1", Vec::new()),
        );
        assert_eq!(insert.expect("insert").changes, 1);
        assert_eq!(update.expect("update").changes, 1);

        let output = controller
            .execute("SELECT x FROM t", Vec::new())
            .await
            .expect("select");
        assert_eq!(output.rows(), &[vec![Value::Integer(2)]]);
        controller.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_without_dropping() {
        let worker = WorkerConfig {
            max_queue: 1,
            ..WorkerConfig::default()
        };
        let client = ClientConfig {
            max_queue: 1,
            ..ClientConfig::default()
        };
        let controller = Controller::in_process(&worker, &client).expect("controller");
        controller
            .execute("CREATE TABLE t(x)", Vec::new())
            .await
            .expect("create");

        let shared = &controller;
        let insert =
            move |n: i64| shared.execute("INSERT INTO t VALUES (?)", vec![Value::Integer(n)]);
        let (a, b, c, d, e) =
            tokio::join!(insert(1), insert(2), insert(3), insert(4), insert(5));
        for outcome in [a, b, c, d, e] {
            assert_eq!(outcome.expect("insert").changes, 1);
        }
        assert_eq!(controller.pending_requests(), 0);

        let output = controller
            .execute("SELECT count(*), sum(x) FROM t", Vec::new())
            .await
            .expect("count");
        assert_eq!(
            output.rows(),
            &[vec![Value::Integer(5), Value::Integer(15)]]
        );
        controller.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn snapshot_round_trip_between_controllers() {
        let source = in_process();
        source
            .execute(
                "CREATE TABLE notes(body TEXT); INSERT INTO notes VALUES ('hello')",
                Vec::new(),
            )
            .await
            .expect("seed");
        let image = source.export_snapshot().await.expect("export");
        source.shutdown().expect("shutdown");

        let target = in_process();
        target.import_snapshot(image).await.expect("import");
        let output = target
            .execute("SELECT body FROM notes", Vec::new())
            .await
            .expect("select");
        assert_eq!(output.rows(), &[vec![Value::Text("hello".into())]]);
        target.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn rejected_import_keeps_existing_rows() {
        let controller = in_process();
        controller
            .execute("CREATE TABLE t(x); INSERT INTO t VALUES (3)", Vec::new())
            .await
            .expect("seed");
        let err = controller
            .import_snapshot(b"definitely not sqlite".to_vec())
            .await
            .expect_err("bad image");
        assert_eq!(err.kind(), Some(ErrorKind::EngineError));
        let output = controller
            .execute("SELECT x FROM t", Vec::new())
            .await
            .expect("select");
        assert_eq!(output.rows(), &[vec![Value::Integer(3)]]);
        controller.shutdown().expect("shutdown");
    }

    #[tokio::test]
    async fn manual_initialize_makes_worker_ready() {
        let worker = WorkerConfig {
            auto_initialize: false,
            ..WorkerConfig::default()
        };
        let controller =
            Controller::in_process(&worker, &ClientConfig::default()).expect("controller");

        let err = controller
            .execute("SELECT 1", Vec::new())
            .await
            .expect_err("not ready");
        assert_eq!(err.kind(), Some(ErrorKind::NotInitialized));

        controller.initialize().await.expect("init");
        controller.initialize().await.expect("second init is a no-op");
        controller.wait_ready().await.expect("ready");
        controller
            .execute("SELECT 1", Vec::new())
            .await
            .expect("select");
        controller.shutdown().expect("shutdown");
    }
}
