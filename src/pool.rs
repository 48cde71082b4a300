//! The data source: session pooling and the multiplexing dispatcher.
//!
//! Two submission paths. [`Pool::submit`] is connectionless: the
//! dispatcher leases whichever session can take one more pipelined
//! command, so many callers interleave onto few connections.
//! [`Pool::acquire`] checks a session out exclusively, for callers with
//! session affinity (transactions, LISTEN).
use std::sync::Arc;

use crate::{
    Result,
    command::Command,
    common::Latch,
    error::Error,
    reader::CommandReader,
    session::Session,
};

mod config;
mod worker;

pub use config::PoolConfig;

use worker::WorkerHandle;

/// Database session pool and multiplexing dispatcher.
///
/// Cheap to clone; all clones share the pool. The pool's lifecycle is
/// explicit: it starts at [`connect`][Pool::connect] and ends at
/// [`close`][Pool::close].
#[derive(Debug, Clone)]
pub struct Pool {
    handle: WorkerHandle,
    allow_pipelining: bool,
}

impl Pool {
    /// Create a [`Pool`] and verify it can reach the server.
    pub async fn connect(url: &str) -> Result<Pool> {
        Self::connect_with(PoolConfig::new(crate::Config::parse(url)?)).await
    }

    /// Create a [`Pool`] and verify it can reach the server.
    pub async fn connect_with(config: PoolConfig) -> Result<Pool> {
        let pool = Self::connect_lazy_with(config);
        // open the first session eagerly so a bad endpoint fails here
        pool.handle.lease().await?;
        Ok(pool)
    }

    /// Create a [`Pool`] without trying to connect.
    pub fn connect_lazy_with(config: PoolConfig) -> Pool {
        let allow_pipelining = config.allow_pipelining;
        let (handle, worker) = WorkerHandle::new(config);
        tokio::spawn(worker.run());
        Pool { handle, allow_pipelining }
    }

    /// Submit a command without holding a session.
    ///
    /// The dispatcher picks a session with a free write lock and minimal
    /// queue, opening new sessions up to the pool size; when every session
    /// is saturated the submission waits for the next completion. Ordering
    /// across sessions is not guaranteed; within a session it is FIFO.
    pub async fn submit(&self, command: Command) -> Result<CommandReader> {
        let session = self.handle.lease().await?;
        session.submit(command).await
    }

    /// Check a session out exclusively until the returned handle drops.
    pub async fn acquire(&self) -> Result<PoolSession> {
        let session = self.handle.acquire().await?;
        Ok(PoolSession {
            session: Some(session),
            handle: self.handle.clone(),
            allow_pipelining: self.allow_pipelining,
            last: None,
        })
    }

    /// Tear the pool down: fail queued submissions, close every session.
    pub async fn close(&self) {
        self.handle.close().await;
    }
}

/// A session checked out of the pool, returned on drop.
#[derive(Debug)]
pub struct PoolSession {
    session: Option<Session>,
    handle: WorkerHandle,
    allow_pipelining: bool,
    last: Option<Arc<Latch>>,
}

impl PoolSession {
    /// The underlying session.
    pub fn session(&self) -> &Session {
        // `session` only `None` on drop
        self.session.as_ref().expect("session present until drop")
    }

    /// Submit on this session.
    ///
    /// With pipelining disabled for the pool, a submit while the previous
    /// command on this handle is unfinished fails instead of queueing.
    pub async fn submit(&mut self, command: Command) -> Result<CommandReader> {
        if !self.allow_pipelining
            && let Some(last) = &self.last
            && !last.is_fired()
        {
            return Err(Error::invalid_state("submit", "command in progress on this session"));
        }
        let reader = self.session().submit(command).await?;
        self.last = Some(reader.completion());
        Ok(reader)
    }
}

impl Drop for PoolSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.handle.release(session);
        }
    }
}
