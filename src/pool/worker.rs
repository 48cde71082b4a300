//! The dispatcher worker: a long-lived task owning the session set.
//!
//! Callers talk to it through an mpsc handle; sessions report queue
//! progress through a second channel, so a completed slot immediately
//! frees capacity for blocked submissions.
use std::collections::{HashMap, VecDeque};

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    Result,
    common::verbose,
    error::Error,
    session::{PoolHook, PoolNotice, Session, SessionStatus},
};

use super::PoolConfig;

pub(crate) enum WorkerMessage {
    /// Multiplexed path: borrow any eligible session for one command.
    Lease(oneshot::Sender<Result<Session>>),
    /// Exclusive path: check a session out until released.
    Acquire(oneshot::Sender<Result<Session>>),
    /// An exclusive checkout coming back.
    Release(Session),
    Connected(Result<Session>),
    Close(oneshot::Sender<()>),
}

#[derive(Clone)]
pub(crate) struct WorkerHandle {
    send: UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub(crate) fn new(config: PoolConfig) -> (WorkerHandle, Worker) {
        let (send, recv) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        (
            WorkerHandle { send: send.clone() },
            Worker {
                config,
                // weak, so dropping every Pool handle ends the worker
                send: send.downgrade(),
                recv,
                notice_tx,
                notices,
                entries: HashMap::new(),
                next_id: 0,
                connecting: 0,
                tick: 0,
                lease_waiters: VecDeque::new(),
                acquire_waiters: VecDeque::new(),
                closed: false,
            },
        )
    }

    pub(crate) async fn lease(&self) -> Result<Session> {
        let (tx, rx) = oneshot::channel();
        self.submit(WorkerMessage::Lease(tx))?;
        rx.await
            .map_err(|_| Error::invalid_state("lease a session", "pool is closed"))?
    }

    pub(crate) async fn acquire(&self) -> Result<Session> {
        let (tx, rx) = oneshot::channel();
        self.submit(WorkerMessage::Acquire(tx))?;
        rx.await
            .map_err(|_| Error::invalid_state("acquire a session", "pool is closed"))?
    }

    pub(crate) fn release(&self, session: Session) {
        let _ = self.send.send(WorkerMessage::Release(session));
    }

    pub(crate) async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send.send(WorkerMessage::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn submit(&self, message: WorkerMessage) -> Result<()> {
        self.send
            .send(message)
            .map_err(|_| Error::invalid_state("reach the dispatcher", "pool is closed"))
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WorkerHandle")
    }
}

struct Entry {
    session: Session,
    exclusive: bool,
    last_used: u64,
}

pub(crate) struct Worker {
    config: PoolConfig,
    send: mpsc::WeakUnboundedSender<WorkerMessage>,
    recv: UnboundedReceiver<WorkerMessage>,
    notice_tx: UnboundedSender<PoolNotice>,
    notices: UnboundedReceiver<PoolNotice>,
    entries: HashMap<usize, Entry>,
    next_id: usize,
    connecting: usize,
    tick: u64,
    lease_waiters: VecDeque<oneshot::Sender<Result<Session>>>,
    acquire_waiters: VecDeque<oneshot::Sender<Result<Session>>>,
    closed: bool,
}

impl Worker {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                message = self.recv.recv() => {
                    match message {
                        // every Pool handle dropped
                        None => break,
                        Some(message) => {
                            if self.handle(message) {
                                break;
                            }
                        },
                    }
                },
                Some(notice) = self.notices.recv() => self.notice(notice),
            }
            self.pump();
        }

        for (_, entry) in self.entries.drain() {
            let session = entry.session;
            tokio::spawn(async move {
                let _ = session.close().await;
            });
        }
    }

    /// Returns true when the worker should shut down.
    fn handle(&mut self, message: WorkerMessage) -> bool {
        match message {
            WorkerMessage::Lease(tx) => {
                if self.closed {
                    let _ = tx.send(Err(Error::invalid_state("lease a session", "pool is closed")));
                } else {
                    self.lease_waiters.push_back(tx);
                }
            },
            WorkerMessage::Acquire(tx) => {
                if self.closed {
                    let _ = tx.send(Err(Error::invalid_state("acquire a session", "pool is closed")));
                } else {
                    self.acquire_waiters.push_back(tx);
                }
            },
            WorkerMessage::Release(session) => {
                let Some(id) = session.pool_id() else { return false };
                match session.status() {
                    SessionStatus::Ready => {
                        if let Some(entry) = self.entries.get_mut(&id) {
                            entry.exclusive = false;
                        }
                    },
                    SessionStatus::Broken => {
                        self.entries.remove(&id);
                    },
                    // released mid-transaction: the abandoned transaction
                    // must not leak into other callers, and the server
                    // rolls it back when the session closes
                    _ => {
                        self.entries.remove(&id);
                        tokio::spawn(async move {
                            let _ = session.close().await;
                        });
                    },
                }
            },
            WorkerMessage::Connected(Ok(session)) => {
                self.connecting -= 1;
                let Some(id) = session.pool_id() else { return false };
                verbose!(target: "pool", id, "session connected");
                self.entries.insert(id, Entry { session, exclusive: false, last_used: 0 });
            },
            WorkerMessage::Connected(Err(err)) => {
                self.connecting -= 1;
                tracing::error!(target: "pgmux", "failed to connect: {err}");
                // fail one waiter instead of letting everyone hang
                if let Some(tx) = self.lease_waiters.pop_front() {
                    let _ = tx.send(Err(err));
                } else if let Some(tx) = self.acquire_waiters.pop_front() {
                    let _ = tx.send(Err(err));
                }
            },
            WorkerMessage::Close(tx) => {
                self.closed = true;
                for tx in self.lease_waiters.drain(..) {
                    let _ = tx.send(Err(Error::invalid_state("lease a session", "pool is closed")));
                }
                for tx in self.acquire_waiters.drain(..) {
                    let _ = tx.send(Err(Error::invalid_state("acquire a session", "pool is closed")));
                }
                let _ = tx.send(());
                return true;
            },
        }
        false
    }

    fn notice(&mut self, notice: PoolNotice) {
        match notice {
            // capacity freed; pump will serve waiters
            PoolNotice::Completed(_) => {},
            PoolNotice::Broken(id) => {
                verbose!(target: "pool", id, "session broken");
                self.entries.remove(&id);
            },
        }
    }

    /// Serve waiters with what the session set can give right now, then
    /// top up connections if someone is still blocked.
    fn pump(&mut self) {
        crate::common::span!("pool_pump");
        if self.closed {
            return;
        }

        while let Some(tx) = self.acquire_waiters.front() {
            if tx.is_closed() {
                self.acquire_waiters.pop_front();
                continue;
            }
            let Some(id) = self.pick_idle() else { break };
            let Some(tx) = self.acquire_waiters.pop_front() else { break };
            self.lend(id, tx, true);
        }

        while let Some(tx) = self.lease_waiters.front() {
            if tx.is_closed() {
                self.lease_waiters.pop_front();
                continue;
            }
            let Some(id) = self.pick_shared() else { break };
            let Some(tx) = self.lease_waiters.pop_front() else { break };
            self.lend(id, tx, false);
        }

        let starving = !self.lease_waiters.is_empty() || !self.acquire_waiters.is_empty();
        if starving && self.entries.len() + self.connecting < self.config.max_sessions {
            self.connect_one();
        }
    }

    fn lend(&mut self, id: usize, tx: oneshot::Sender<Result<Session>>, exclusive: bool) {
        self.tick += 1;
        let tick = self.tick;
        let Some(entry) = self.entries.get_mut(&id) else { return };
        entry.last_used = tick;
        entry.exclusive = exclusive;
        if tx.send(Ok(entry.session.clone())).is_err() {
            // caller gave up while queued
            entry.exclusive = false;
        }
    }

    /// A Ready session with nothing in flight, for exclusive checkout.
    ///
    /// Sessions inside a transaction block belong to whoever opened it and
    /// are never handed out.
    fn pick_idle(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.exclusive && matches!(e.session.status(), SessionStatus::Ready))
            .filter(|(_, e)| e.session.pending() == 0)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(id, _)| *id)
    }

    /// The best Ready session to interleave one more command onto: write
    /// lock free first, then fewest pending slots, ties to the least
    /// recently used.
    fn pick_shared(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.exclusive && matches!(e.session.status(), SessionStatus::Ready))
            .filter(|(_, e)| e.session.pending() < self.config.max_queue_depth)
            .min_by_key(|(_, e)| {
                (e.session.is_writing() as usize, e.session.pending(), e.last_used)
            })
            .map(|(id, _)| *id)
    }

    fn connect_one(&mut self) {
        let Some(send) = self.send.upgrade() else { return };
        self.connecting += 1;
        let id = self.next_id;
        self.next_id += 1;

        let config = self.config.conn.clone();
        let hook = PoolHook { id, tx: self.notice_tx.clone() };
        tokio::spawn(async move {
            let result = Session::connect_pooled(config, hook).await;
            let _ = send.send(WorkerMessage::Connected(result));
        });
    }
}
