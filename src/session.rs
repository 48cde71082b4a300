//! The protocol session: one connection, one read loop, one write lock.
//!
//! Writers serialize on the write lock and release it once their command's
//! final message is flushed, *before* the response is read. The read loop
//! is a single long-lived task owning the read half; it feeds backend
//! messages to the head slot of the operation queue and advances the queue
//! at every `ReadyForQuery`. That split is what lets one caller write while
//! another is still reading: pipelining.
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        Arc, Mutex as StdMutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, mpsc::UnboundedSender};

use crate::{
    Result,
    command::{Command, CommandKind, CommandValues, ExecutionFlags, SlotPlan, Statement, StmtPlan},
    common::{ByteStr, lock, verbose},
    config::Config,
    encode::{BindError, Param},
    error::{BrokenError, Error},
    handshake,
    net::{Io, Socket},
    postgres::{
        BackendMessage, BackendProtocol, PgFormat, ProtocolError,
        backend::{BackendKeyData, NotificationResponse, TransactionStatus},
        frontend,
    },
    queue::{self, OpSlot},
    reader::CommandReader,
    statement::{RowLayout, StatementCache, StatementKey, StatementName, StatementState},
    stream::{ReadPipe, WritePipe},
};

/// Notifications buffered per session before the oldest is dropped.
const NOTIFICATION_BUFFER: usize = 128;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Ready,
    InTransaction,
    InFailedTransaction,
    /// Terminal. A broken session never returns to the pool.
    Broken,
}

impl SessionStatus {
    fn from_transaction(status: TransactionStatus) -> SessionStatus {
        match status {
            TransactionStatus::Idle => SessionStatus::Ready,
            TransactionStatus::InTransaction => SessionStatus::InTransaction,
            TransactionStatus::InFailedTransaction => SessionStatus::InFailedTransaction,
        }
    }
}

/// How a pooled session reports queue progress back to its dispatcher.
#[derive(Debug)]
pub(crate) enum PoolNotice {
    /// A slot completed on session `id`; capacity freed.
    Completed(usize),
    /// Session `id` is broken and must be discarded.
    Broken(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct PoolHook {
    pub id: usize,
    pub tx: UnboundedSender<PoolNotice>,
}

/// One authenticated connection to the server.
///
/// Cheap to clone; all clones share the connection.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// The write lock. Held for the duration of one command's write, from
    /// first byte to the flush after Sync, never across a response read.
    write: Mutex<WritePipe>,
    /// Selection hint for the dispatcher; true while a writer holds the lock.
    writing: AtomicBool,
    stmts: StdMutex<StatementCache>,
    state: StdMutex<State>,
    backend_key: OnceLock<BackendKeyData>,
    notifications: StdMutex<VecDeque<NotificationResponse>>,
    pool: Option<PoolHook>,
    config: Config,
}

#[derive(Debug)]
struct State {
    status: SessionStatus,
    broken: Option<BrokenError>,
    /// Pending operation slots, head = the command currently reading.
    queue: VecDeque<OpSlot>,
    parameters: HashMap<ByteStr, ByteStr>,
}

enum WriteFailure {
    Bind(BindError),
    Io(io::Error),
}

impl Session {
    /// Connect and authenticate using `config`'s endpoint.
    pub async fn connect(config: Config) -> Result<Session> {
        let socket = match &config.socket {
            Some(path) => Socket::connect_unix(path).await?,
            None => Socket::connect_tcp(&config.host, config.port).await?,
        };
        Self::establish(socket, config, None).await
    }

    /// Run a session over an already established duplex.
    ///
    /// The duplex is assumed to lead to a server speaking the backend
    /// protocol from startup, e.g. through a TLS or SCRAM wrapper, or an
    /// in-process test server.
    pub async fn connect_io(io: impl Io, config: Config) -> Result<Session> {
        Self::establish(Socket::from_io(io), config, None).await
    }

    pub(crate) async fn connect_pooled(config: Config, hook: PoolHook) -> Result<Session> {
        let socket = match &config.socket {
            Some(path) => Socket::connect_unix(path).await?,
            None => Socket::connect_tcp(&config.host, config.port).await?,
        };
        Self::establish(socket, config, Some(hook)).await
    }

    async fn establish(socket: Socket, config: Config, pool: Option<PoolHook>) -> Result<Session> {
        let handshake = async {
            let (r, w) = tokio::io::split(socket);
            let mut read = ReadPipe::new(r);
            let mut write = WritePipe::new(w, config.flush_threshold);
            let handshake = handshake::startup(&mut write, &mut read, &config).await?;
            Ok::<_, Error>((read, write, handshake))
        };
        let (read, write, handshake) = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))??;

        let shared = Arc::new(Shared {
            write: Mutex::new(write),
            writing: AtomicBool::new(false),
            stmts: StdMutex::new(StatementCache::new(config.statement_cache_capacity)),
            state: StdMutex::new(State {
                status: SessionStatus::from_transaction(handshake.status),
                broken: None,
                queue: VecDeque::new(),
                parameters: handshake.parameters,
            }),
            backend_key: OnceLock::new(),
            notifications: StdMutex::new(VecDeque::new()),
            pool,
            config,
        });
        if let Some(key) = handshake.key {
            let _ = shared.backend_key.set(key);
        }

        tokio::spawn(read_loop(shared.clone(), read));

        Ok(Session { shared })
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.shared.state).status
    }

    /// The server process backing this session, once known.
    pub fn backend_pid(&self) -> Option<i32> {
        self.shared.backend_key.get().map(|k| k.process_id)
    }

    /// Latest reported value of a run-time parameter, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<ByteStr> {
        lock(&self.shared.state).parameters.get(name).cloned()
    }

    /// Drain the buffered `NOTIFY` messages received so far.
    pub fn take_notifications(&self) -> Vec<NotificationResponse> {
        lock(&self.shared.notifications).drain(..).collect()
    }

    /// Commands enqueued and not yet completed.
    pub(crate) fn pending(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.shared.writing.load(Ordering::Acquire)
    }

    pub(crate) fn pool_id(&self) -> Option<usize> {
        self.shared.pool.as_ref().map(|hook| hook.id)
    }

    /// Submit a command: serialize its frontend messages under the write
    /// lock and return the reader bound to its response slot.
    ///
    /// The lock is released when this returns; reading the response happens
    /// through the [`CommandReader`] while other callers may already be
    /// writing their own commands.
    pub async fn submit(&self, command: Command) -> Result<CommandReader> {
        let values = command.into_values()?;
        self.submit_values(values).await
    }

    pub(crate) async fn submit_values(&self, values: CommandValues) -> Result<CommandReader> {
        if let Some(broken) = &lock(&self.shared.state).broken {
            return Err(broken.clone().into());
        }

        let mut write = self.shared.write.lock().await;
        self.shared.writing.store(true, Ordering::Release);
        let result = self.write_command(&mut write, values).await;
        self.shared.writing.store(false, Ordering::Release);
        result
    }

    async fn write_command(
        &self,
        write: &mut WritePipe,
        values: CommandValues,
    ) -> Result<CommandReader> {
        let CommandValues { kind, statements, flags, timeout } = values;
        let schema_only = flags.contains(ExecutionFlags::SCHEMA_ONLY);
        let single_row = flags.contains(ExecutionFlags::SINGLE_ROW);
        let persistent = kind == CommandKind::Extended && !flags.contains(ExecutionFlags::UNPREPARED);

        // plan each statement against the cache
        let mut names = Vec::with_capacity(statements.len());
        let mut plans = Vec::with_capacity(statements.len());
        let mut pending_parses = VecDeque::new();
        let mut pending_describes = VecDeque::new();
        let mut closes = Vec::new();

        if kind == CommandKind::Extended {
            let mut stmts = lock(&self.shared.stmts);
            for statement in &statements {
                if !persistent {
                    names.push(StatementName::unnamed());
                    plans.push(StmtPlan { parse: true, describe: true, row: None });
                    continue;
                }
                let key = StatementKey {
                    sql: statement.sql.bytestr(),
                    param_oids: statement.params.iter().map(Param::oid).collect(),
                };
                match stmts.get(&key).map(|c| (c.state, c.name.clone(), c.row.clone())) {
                    Some((StatementState::Complete, name, row)) => {
                        let describe = schema_only || row.is_none();
                        if describe && !schema_only {
                            pending_describes.push_back(key);
                        }
                        names.push(name);
                        plans.push(StmtPlan { parse: false, describe, row });
                    },
                    Some((StatementState::Preparing, _, _)) => {
                        // a pipelined peer is mid-parse on this statement;
                        // fall back to the unnamed statement
                        names.push(StatementName::unnamed());
                        plans.push(StmtPlan { parse: true, describe: true, row: None });
                    },
                    _ => {
                        let name = stmts.insert_preparing(key.clone());
                        pending_parses.push_back(key.clone());
                        if !schema_only {
                            pending_describes.push_back(key);
                        }
                        names.push(name);
                        plans.push(StmtPlan { parse: true, describe: true, row: None });
                    },
                }
            }
            closes = stmts.take_pending_close();
        }

        let parse_keys: Vec<StatementKey> = pending_parses.iter().cloned().collect();
        let plan = SlotPlan {
            kind,
            schema_only,
            closes: closes.len(),
            statements: plans,
        };

        // enqueue before the first byte, so responses always find a slot
        let (mut op, handle) = queue::slot();
        op.pending_parses = pending_parses;
        op.pending_describes = pending_describes;
        {
            let mut state = lock(&self.shared.state);
            if let Some(broken) = &state.broken {
                return Err(broken.clone().into());
            }
            if state.queue.is_empty() {
                op.read_ready.fire();
            }
            state.queue.push_back(op);
        }

        let mut flushed = false;
        let write_result: Result<(), WriteFailure> = async {
            for name in &closes {
                write.send(frontend::Close { variant: b'S', name: name.as_str() });
            }
            match kind {
                CommandKind::Simple => {
                    if let Some(statement) = statements.first() {
                        write.send(frontend::Query { sql: &statement.sql });
                    }
                },
                CommandKind::Extended => {
                    for (index, statement) in statements.into_iter().enumerate() {
                        let name = names[index].as_str();
                        let Statement { sql, params } = statement;
                        if plan.statements[index].parse {
                            let oids: Vec<u32> = params.iter().map(Param::oid).collect();
                            write.send(frontend::Parse { statement: name, sql: &sql, param_oids: &oids });
                        }
                        if schema_only {
                            write.send(frontend::Describe { kind: b'S', name });
                        } else {
                            frontend::Bind {
                                portal: "",
                                statement: name,
                                params,
                                result_format: PgFormat::Binary,
                            }
                            .write(write.buf_mut())
                            .map_err(WriteFailure::Bind)?;
                            if plan.statements[index].describe {
                                write.send(frontend::Describe { kind: b'P', name: "" });
                            }
                            let max_rows = if single_row { 1 } else { 0 };
                            write.send(frontend::Execute { portal: "", max_rows });
                        }
                        flushed |= write.maybe_flush().await.map_err(WriteFailure::Io)?;
                    }
                    write.send(frontend::Sync);
                },
            }
            write.flush().await.map_err(WriteFailure::Io)?;
            Ok(())
        }
        .await;

        match write_result {
            Ok(()) => {},
            Err(WriteFailure::Bind(err)) if !flushed => {
                // nothing hit the wire: retract the slot and undo the plan
                write.buf_mut().clear();
                lock(&self.shared.state).queue.pop_back();
                let mut stmts = lock(&self.shared.stmts);
                for key in &parse_keys {
                    stmts.invalidate(key);
                }
                for name in closes {
                    stmts.requeue_close(name);
                }
                return Err(err.into());
            },
            Err(WriteFailure::Bind(err)) => {
                // part of the command is on the wire; a bare Sync restores
                // protocol synchronization and the slot drains at its
                // ReadyForQuery in the read loop
                write.send(frontend::Sync);
                if let Err(io) = write.flush().await {
                    let broken = BrokenError::new(&io);
                    self.break_with(broken);
                }
                return Err(err.into());
            },
            Err(WriteFailure::Io(err)) => {
                let broken = BrokenError::new(&err);
                self.break_with(broken);
                return Err(err.into());
            },
        }

        verbose!(pending = self.pending(), "command written");

        // the command timeout starts once the bytes are queued for write
        let timeout = timeout.or(self.shared.config.command_timeout);
        if let Some(duration) = timeout {
            let session = self.clone();
            let completion = handle.completion.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = completion.wait() => {},
                    _ = tokio::time::sleep(duration) => {
                        let deadline = session.shared.config.cancellation_timeout;
                        let _ = session.perform_user_cancellation(deadline).await;
                    },
                }
            });
        }

        Ok(CommandReader::new(self.clone(), handle, plan, timeout))
    }

    /// Ask the server to abort whatever this session is running.
    ///
    /// Opens a short-lived second connection and sends a CancelRequest for
    /// this session's backend. The write lock is awaited up to `deadline`
    /// first so the cancel cannot race a half-written command; on elapse
    /// the session is forcibly broken.
    ///
    /// Cancellation is a request: the running command observes it as an
    /// `ErrorResponse` with SQLSTATE 57014 on the main connection.
    pub async fn perform_user_cancellation(&self, deadline: Duration) -> Result<()> {
        let Some(key) = self.shared.backend_key.get().copied() else {
            return Err(Error::invalid_state("cancel", "backend key not received"));
        };

        let guard = match tokio::time::timeout(deadline, self.shared.write.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                let broken = BrokenError::cancel_timeout();
                self.break_with(broken.clone());
                return Err(broken.into());
            },
        };

        let config = &self.shared.config;
        let cancel = async {
            let mut socket = match &config.socket {
                Some(path) => Socket::connect_unix(path).await?,
                None => Socket::connect_tcp(&config.host, config.port).await?,
            };
            let mut buf = bytes::BytesMut::with_capacity(16);
            frontend::CancelRequest {
                process_id: key.process_id,
                secret_key: key.secret_key,
            }
            .write(&mut buf);
            use tokio::io::AsyncWriteExt;
            socket.write_all(&buf).await?;
            socket.shutdown().await
        };
        let result = tokio::time::timeout(deadline, cancel).await;
        drop(guard);

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "cancel request timeout").into()),
        }
    }

    /// Terminate the session: `error` carries the cause, `None` means an
    /// orderly local close.
    ///
    /// Transitions to `Broken`, fails every pending slot in FIFO order with
    /// the same error, and closes the duplex. Idempotent.
    pub fn complete(&self, error: Option<&Error>) {
        let broken = match error {
            Some(cause) => BrokenError::new(cause),
            None => BrokenError::closed(),
        };
        self.break_with(broken);
    }

    pub(crate) fn break_with(&self, broken: BrokenError) {
        break_shared(&self.shared, broken);
    }

    /// Gracefully close: Terminate, flush, shut the socket down.
    ///
    /// Commands still pending complete with a broken-session error.
    pub async fn close(&self) -> Result<()> {
        if lock(&self.shared.state).broken.is_some() {
            return Ok(());
        }
        let mut write = self.shared.write.lock().await;
        write.send(frontend::Terminate);
        write.flush().await?;
        write.shutdown().await?;
        Ok(())
    }
}

fn break_shared(shared: &Arc<Shared>, broken: BrokenError) {
    {
        let mut state = lock(&shared.state);
        if state.broken.is_some() {
            return;
        }
        state.status = SessionStatus::Broken;
        state.broken = Some(broken.clone());
        for slot in state.queue.drain(..) {
            slot.complete(Err(broken.clone()));
        }
    }

    if let Some(hook) = &shared.pool {
        let _ = hook.tx.send(PoolNotice::Broken(hook.id));
    }

    // close the duplex so both halves unblock
    let shared = shared.clone();
    tokio::spawn(async move {
        let mut write = shared.write.lock().await;
        let _ = write.shutdown().await;
    });
}

/// The session's read loop: a single long-lived task owning the read half.
///
/// Async responses are intercepted here; everything else is routed to the
/// head slot. Any I/O or framing failure breaks the session as a whole.
async fn read_loop(shared: Arc<Shared>, mut read: ReadPipe) {
    let broken = loop {
        let raw = match read.read_message().await {
            Ok(Some(raw)) => raw,
            Ok(None) => break BrokenError::closed(),
            Err(err) => break BrokenError::new(&err),
        };
        let msgtype = raw.msgtype;

        // async responses never advance command state
        if BackendMessage::is_async(msgtype) {
            match BackendMessage::decode(msgtype, raw.body) {
                Ok(BackendMessage::NoticeResponse(notice)) => {
                    tracing::warn!(target: "pgmux", "{}", notice.fields);
                },
                Ok(BackendMessage::NotificationResponse(notification)) => {
                    let mut buffer = lock(&shared.notifications);
                    if buffer.len() == NOTIFICATION_BUFFER {
                        buffer.pop_front();
                    }
                    buffer.push_back(notification);
                },
                Ok(BackendMessage::ParameterStatus(param)) => {
                    lock(&shared.state).parameters.insert(param.name, param.value);
                },
                Ok(_) => {},
                Err(err) => break BrokenError::new(&err),
            }
            continue;
        }

        let message = match BackendMessage::decode(msgtype, raw.body) {
            Ok(message) => message,
            Err(err) => break BrokenError::new(&err),
        };

        match message {
            BackendMessage::ReadyForQuery(ready) => {
                {
                    let mut state = lock(&shared.state);
                    state.status = SessionStatus::from_transaction(ready.status);
                    let Some(slot) = state.queue.pop_front() else {
                        break BrokenError::new(&ProtocolError::unexpected_phase(
                            msgtype,
                            "no command pending",
                        ));
                    };
                    // parses that never completed stay Preparing forever;
                    // drop them so later commands re-prepare
                    {
                        let mut stmts = lock(&shared.stmts);
                        for key in slot.pending_parses.iter() {
                            stmts.invalidate_if_preparing(key);
                        }
                    }
                    slot.complete(Ok(ready.status));
                    if let Some(next) = state.queue.front() {
                        next.read_ready.fire();
                    }
                }
                if let Some(hook) = &shared.pool {
                    let _ = hook.tx.send(PoolNotice::Completed(hook.id));
                }
            },
            message => {
                let mut state = lock(&shared.state);
                let Some(head) = state.queue.front_mut() else {
                    break BrokenError::new(&ProtocolError::unexpected_phase(
                        msgtype,
                        "no command pending",
                    ));
                };
                match &message {
                    BackendMessage::ParseComplete(_) => {
                        if let Some(key) = head.pending_parses.pop_front() {
                            lock(&shared.stmts).promote(&key);
                        }
                    },
                    BackendMessage::RowDescription(rd) => {
                        if let Some(key) = head.pending_describes.pop_front() {
                            lock(&shared.stmts).set_row(&key, RowLayout::Columns(rd.columns.clone()));
                        }
                    },
                    BackendMessage::NoData(_) => {
                        if let Some(key) = head.pending_describes.pop_front() {
                            lock(&shared.stmts).set_row(&key, RowLayout::NoData);
                        }
                    },
                    BackendMessage::ErrorResponse(_) => {
                        let mut stmts = lock(&shared.stmts);
                        for key in head.pending_parses.drain(..) {
                            stmts.invalidate(&key);
                        }
                        head.pending_describes.clear();
                    },
                    _ => {},
                }
                head.send(message);
            },
        }
    };

    break_shared(&shared, broken);
}
