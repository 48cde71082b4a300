//! The per-session operation queue.
//!
//! Every submitted command enqueues one slot. The session's read loop only
//! ever feeds the head slot, so a slot's event stream *is* its read turn:
//! messages begin arriving exactly when every prior slot has consumed its
//! terminal `ReadyForQuery`. The latches exist so other parties (pool,
//! pipelined peers, tests) can observe the turn taking without touching
//! the event stream.
use std::{
    collections::VecDeque,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    common::Latch,
    error::BrokenError,
    postgres::backend::{BackendMessage, TransactionStatus},
    statement::StatementKey,
};

/// What the read loop hands to a slot.
#[derive(Debug)]
pub(crate) enum SlotEvent {
    Message(BackendMessage),
    /// Terminal: the command's `ReadyForQuery` was consumed, or the session
    /// broke with every pending slot failed.
    Complete(Result<TransactionStatus, BrokenError>),
}

/// Session side of one enqueued command.
#[derive(Debug)]
pub(crate) struct OpSlot {
    tx: UnboundedSender<SlotEvent>,
    pub(crate) read_ready: Arc<Latch>,
    pub(crate) completion: Arc<Latch>,
    /// Cache keys whose Parse is in flight; front matches the next
    /// ParseComplete.
    pub(crate) pending_parses: VecDeque<StatementKey>,
    /// Cache keys whose result layout Describe is in flight.
    pub(crate) pending_describes: VecDeque<StatementKey>,
}

impl OpSlot {
    pub(crate) fn send(&self, message: BackendMessage) {
        // a dropped reader just discards its messages
        let _ = self.tx.send(SlotEvent::Message(message));
    }

    /// Resolve the slot. Fires both latches: a completed slot is past its
    /// read turn by definition.
    pub(crate) fn complete(&self, result: Result<TransactionStatus, BrokenError>) {
        let _ = self.tx.send(SlotEvent::Complete(result));
        self.read_ready.fire();
        self.completion.fire();
    }
}

/// Reader side of one enqueued command.
#[derive(Debug)]
pub(crate) struct SlotHandle {
    rx: UnboundedReceiver<SlotEvent>,
    pub(crate) read_ready: Arc<Latch>,
    pub(crate) completion: Arc<Latch>,
}

impl SlotHandle {
    pub(crate) fn poll_event(&mut self, cx: &mut Context) -> Poll<SlotEvent> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(event),
            // the session vanished without completing us
            Poll::Ready(None) => {
                Poll::Ready(SlotEvent::Complete(Err(BrokenError::session_dropped())))
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) fn slot() -> (OpSlot, SlotHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let read_ready = Arc::new(Latch::new());
    let completion = Arc::new(Latch::new());
    (
        OpSlot {
            tx,
            read_ready: read_ready.clone(),
            completion: completion.clone(),
            pending_parses: VecDeque::new(),
            pending_describes: VecDeque::new(),
        },
        SlotHandle { rx, read_ready, completion },
    )
}
