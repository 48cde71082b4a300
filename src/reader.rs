//! The command reader: a stateful cursor over one command's responses.
//!
//! Phase-by-phase consumption of the slot's event stream. The session's
//! read loop keeps draining the wire regardless of how far the reader has
//! been driven, so dropping a reader mid-result never wedges the session.
use std::{
    sync::Arc,
    task::{Context, Poll, ready},
    time::Duration,
};

use futures_core::Stream;

use crate::{
    Result,
    command::{CommandKind, SlotPlan},
    common::Latch,
    error::{BrokenError, Error},
    postgres::{
        DatabaseError, ProtocolError,
        backend::{BackendMessage, ColumnInfo, DataRow, TransactionStatus},
    },
    queue::{SlotEvent, SlotHandle},
    session::Session,
    statement::RowLayout,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Uninitialized,
    Active,
    /// The current statement's terminal response was consumed.
    Completed,
    /// Every result was consumed, including the trailing ReadyForQuery.
    Exhausted,
    Closed,
}

/// Progress through the response prelude of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prelude {
    /// CloseComplete of evicted cache entries, before the first statement.
    Closes { remaining: usize },
    Parse,
    Bind,
    ParamDesc,
    RowDesc,
    /// Simple protocol: RowDescription or an immediate terminal.
    SimpleHead,
    /// One message lookahead to learn `has_rows`.
    Peek,
    Done,
}

/// Consumes a single command's response stream.
///
/// Created by [`Session::submit`] / [`Pool::submit`][crate::Pool::submit].
/// Row bytes and column metadata are exposed raw; decoding them is the row
/// decoder collaborator's job.
pub struct CommandReader {
    session: Session,
    handle: SlotHandle,
    plan: SlotPlan,
    state: ReaderState,
    prelude: Prelude,
    advancing: bool,
    stmt_index: usize,
    columns: Option<Arc<[ColumnInfo]>>,
    param_oids: Option<Vec<u32>>,
    row: Option<DataRow>,
    pending: Option<BackendMessage>,
    rows_affected: i64,
    has_rows: bool,
    /// Server error governing this statement and the rest of the batch.
    error: Option<DatabaseError>,
    broken: Option<BrokenError>,
    final_status: Option<TransactionStatus>,
    /// The slot's Complete event was consumed.
    drained: bool,
    timeout: Option<Duration>,
}

impl CommandReader {
    pub(crate) fn new(
        session: Session,
        handle: SlotHandle,
        plan: SlotPlan,
        timeout: Option<Duration>,
    ) -> Self {
        let mut reader = Self {
            session,
            handle,
            plan,
            state: ReaderState::Uninitialized,
            prelude: Prelude::Done,
            advancing: false,
            stmt_index: 0,
            columns: None,
            param_oids: None,
            row: None,
            pending: None,
            rows_affected: -1,
            has_rows: false,
            error: None,
            broken: None,
            final_status: None,
            drained: false,
            timeout,
        };
        reader.enter_statement(0);
        reader
    }

    // ===== caller facing contract =====

    /// Columns of the current result, zero before initialization and for
    /// rowless statements.
    pub fn field_count(&self) -> i16 {
        self.columns.as_ref().map(|c| c.len() as i16).unwrap_or(0)
    }

    /// Whether the current result has at least one row.
    pub fn has_rows(&self) -> bool {
        self.has_rows
    }

    /// Rows affected by the current statement, `-1` when the command tag
    /// carries no modification count.
    pub fn rows_affected(&self) -> i64 {
        self.rows_affected
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReaderState::Closed)
    }

    /// Column metadata of the current result.
    pub fn columns(&self) -> &[ColumnInfo] {
        self.columns.as_deref().unwrap_or(&[])
    }

    /// The row the last successful [`read`][Self::read] stopped on.
    pub fn row(&self) -> Option<&DataRow> {
        self.row.as_ref()
    }

    pub fn take_row(&mut self) -> Option<DataRow> {
        self.row.take()
    }

    /// Parameter types reported by a schema-only Describe.
    pub fn parameter_oids(&self) -> Option<&[u32]> {
        self.param_oids.as_deref()
    }

    /// Transaction status from the command's ReadyForQuery, once consumed.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.final_status
    }

    /// Whether this command's read turn has started: true once every
    /// earlier command on the session consumed its terminal response.
    pub fn is_read_turn(&self) -> bool {
        self.handle.read_ready.is_fired()
    }

    pub(crate) fn completion(&self) -> Arc<Latch> {
        self.handle.completion.clone()
    }

    /// Advance to the next row of the current result.
    ///
    /// The first call also performs initialization: it consumes the
    /// statement's prelude up to the row description, so `field_count` and
    /// `has_rows` are valid afterwards.
    pub async fn read(&mut self) -> Result<bool> {
        std::future::poll_fn(|cx| self.poll_read(cx)).await
    }

    /// Advance to the next statement's result in a batch or multi-statement
    /// simple query.
    ///
    /// Returns `false` once the batch is exhausted. A statement skipped by
    /// an earlier error reports that same error.
    pub async fn next_result(&mut self) -> Result<bool> {
        std::future::poll_fn(|cx| self.poll_next_result(cx)).await
    }

    /// Drain the remaining responses so the session becomes reusable.
    ///
    /// Waits for the command's terminal `ReadyForQuery`, bounded by the
    /// command timeout when one is set; on elapse the session is broken so
    /// it can never be left in an indeterminate state.
    pub async fn close(&mut self) -> Result<()> {
        match self.timeout {
            Some(duration) => {
                let result = tokio::time::timeout(
                    duration,
                    std::future::poll_fn(|cx| self.poll_close(cx)),
                )
                .await;
                match result {
                    Ok(result) => result,
                    Err(_) => {
                        let broken = BrokenError::drain_timeout();
                        self.session.break_with(broken.clone());
                        self.drained = true;
                        self.broken = Some(broken.clone());
                        self.state = ReaderState::Closed;
                        Err(broken.into())
                    },
                }
            },
            None => std::future::poll_fn(|cx| self.poll_close(cx)).await,
        }
    }

    /// Stream the raw rows of the current result.
    pub fn rows(&mut self) -> RowStream<'_> {
        RowStream { reader: self }
    }

    // ===== poll state machine =====

    pub fn poll_read(&mut self, cx: &mut Context) -> Poll<Result<bool>> {
        loop {
            match self.state {
                ReaderState::Uninitialized => ready!(self.poll_prelude(cx))?,
                ReaderState::Active => {
                    let event = ready!(self.poll_event(cx));
                    let message = match event {
                        SlotEvent::Complete(Err(broken)) => {
                            self.state = ReaderState::Closed;
                            return Poll::Ready(Err(broken.into()));
                        },
                        // terminal without a command tag: the server skipped
                        // the statement after an earlier failure
                        SlotEvent::Complete(Ok(_)) => {
                            self.state = ReaderState::Exhausted;
                            return Poll::Ready(match self.error.clone() {
                                Some(db) => Err(db.into()),
                                None => Ok(false),
                            });
                        },
                        SlotEvent::Message(message) => message,
                    };
                    match message {
                        BackendMessage::DataRow(row) => {
                            self.row = Some(row);
                            return Poll::Ready(Ok(true));
                        },
                        BackendMessage::CommandComplete(tag) => {
                            self.row = None;
                            self.rows_affected = tag.rows_affected();
                            self.state = ReaderState::Completed;
                            return Poll::Ready(Ok(false));
                        },
                        BackendMessage::EmptyQueryResponse(_)
                        | BackendMessage::PortalSuspended(_) => {
                            self.row = None;
                            self.state = ReaderState::Completed;
                            return Poll::Ready(Ok(false));
                        },
                        BackendMessage::ErrorResponse(response) => {
                            // failure mid row stream is unrecoverable for
                            // this reader; the session itself drains fine
                            let db = match response.to_db_error() {
                                Ok(db) => db,
                                Err(violation) => return Poll::Ready(Err(self.violation(violation))),
                            };
                            self.error = Some(db.clone());
                            self.row = None;
                            self.state = ReaderState::Closed;
                            return Poll::Ready(Err(db.into()));
                        },
                        unexpected => {
                            let violation = ProtocolError::unexpected_phase(
                                unexpected.msgtype(),
                                "reading rows",
                            );
                            return Poll::Ready(Err(self.violation(violation)));
                        },
                    }
                },
                ReaderState::Completed | ReaderState::Exhausted => return Poll::Ready(Ok(false)),
                ReaderState::Closed => {
                    return Poll::Ready(Err(Error::invalid_state("read", "reader is closed")));
                },
            }
        }
    }

    pub fn poll_next_result(&mut self, cx: &mut Context) -> Poll<Result<bool>> {
        loop {
            match self.state {
                ReaderState::Uninitialized => ready!(self.poll_prelude(cx))?,
                ReaderState::Active => ready!(self.poll_drain_result(cx))?,
                ReaderState::Completed => {
                    let last = match self.plan.kind {
                        CommandKind::Extended => {
                            self.stmt_index + 1 >= self.plan.statements.len()
                        },
                        // the simple protocol reveals exhaustion only at
                        // the terminal ReadyForQuery
                        CommandKind::Simple => false,
                    };

                    if let Some(db) = self.error.clone() {
                        if self.plan.kind == CommandKind::Extended && !last {
                            // skipped by the server; completes with the
                            // same error as the statement that failed
                            self.stmt_index += 1;
                            return Poll::Ready(Err(db.into()));
                        }
                        ready!(self.poll_finish(cx))?;
                        return Poll::Ready(Ok(false));
                    }

                    if last {
                        ready!(self.poll_finish(cx))?;
                        return Poll::Ready(Ok(false));
                    }

                    if !self.advancing {
                        self.enter_statement(self.stmt_index + 1);
                        self.advancing = true;
                    }
                    ready!(self.poll_prelude(cx))?;
                    self.advancing = false;
                    return Poll::Ready(Ok(!matches!(self.state, ReaderState::Exhausted)));
                },
                ReaderState::Exhausted => return Poll::Ready(Ok(false)),
                ReaderState::Closed => {
                    return Poll::Ready(Err(Error::invalid_state("advance", "reader is closed")));
                },
            }
        }
    }

    pub fn poll_close(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            if self.drained {
                self.state = ReaderState::Closed;
                return Poll::Ready(match &self.broken {
                    Some(broken) => Err(broken.clone().into()),
                    None => Ok(()),
                });
            }
            // discard everything up to the slot's terminal event
            let _ = ready!(self.poll_event(cx));
        }
    }

    /// Consume the statement prelude up to the row phase.
    fn poll_prelude(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            if matches!(self.prelude, Prelude::Done) {
                return Poll::Ready(Ok(()));
            }

            let event = ready!(self.poll_event(cx));
            let message = match event {
                SlotEvent::Complete(Err(broken)) => {
                    self.state = ReaderState::Closed;
                    return Poll::Ready(Err(broken.into()));
                },
                SlotEvent::Complete(Ok(_)) => {
                    if matches!(self.prelude, Prelude::SimpleHead) {
                        // no further result in the simple query string
                        self.state = ReaderState::Exhausted;
                        self.prelude = Prelude::Done;
                        return Poll::Ready(Ok(()));
                    }
                    let violation = ProtocolError::unexpected_phase(
                        crate::postgres::backend::ReadyForQuery::MSGTYPE,
                        "command response prelude",
                    );
                    self.state = ReaderState::Closed;
                    return Poll::Ready(Err(violation.into()));
                },
                SlotEvent::Message(message) => message,
            };

            match (self.prelude, message) {
                (Prelude::Closes { remaining }, BackendMessage::CloseComplete(_)) => {
                    self.prelude = match remaining - 1 {
                        0 => self.first_step(),
                        remaining => Prelude::Closes { remaining },
                    };
                },
                (Prelude::Parse, BackendMessage::ParseComplete(_)) => {
                    self.prelude = match self.plan.schema_only {
                        true => Prelude::ParamDesc,
                        false => Prelude::Bind,
                    };
                },
                (Prelude::Bind, BackendMessage::BindComplete(_)) => {
                    self.prelude = self.after_bind();
                },
                (Prelude::ParamDesc, BackendMessage::ParameterDescription(desc)) => {
                    self.param_oids = Some(desc.oids);
                    self.prelude = Prelude::RowDesc;
                },
                (Prelude::RowDesc, BackendMessage::RowDescription(desc)) => {
                    self.columns = Some(desc.columns);
                    self.prelude = self.after_row_description();
                },
                (Prelude::RowDesc, BackendMessage::NoData(_)) => {
                    self.prelude = self.after_row_description();
                },
                (Prelude::SimpleHead, BackendMessage::RowDescription(desc)) => {
                    self.columns = Some(desc.columns);
                    self.prelude = Prelude::Peek;
                },
                (Prelude::SimpleHead, BackendMessage::CommandComplete(tag)) => {
                    // a result without rows, e.g. SET
                    self.rows_affected = tag.rows_affected();
                    self.state = ReaderState::Completed;
                    self.prelude = Prelude::Done;
                },
                (Prelude::SimpleHead, BackendMessage::EmptyQueryResponse(_)) => {
                    self.state = ReaderState::Completed;
                    self.prelude = Prelude::Done;
                },
                (_, BackendMessage::ErrorResponse(response)) => {
                    let db = match response.to_db_error() {
                        Ok(db) => db,
                        Err(violation) => return Poll::Ready(Err(self.violation(violation))),
                    };
                    self.error = Some(db.clone());
                    self.state = ReaderState::Completed;
                    self.prelude = Prelude::Done;
                    return Poll::Ready(Err(db.into()));
                },
                (Prelude::Peek, message) => {
                    self.has_rows = matches!(message, BackendMessage::DataRow(_));
                    self.pending = Some(message);
                    self.state = ReaderState::Active;
                    self.prelude = Prelude::Done;
                },
                (_, unexpected) => {
                    let violation = ProtocolError::unexpected_phase(
                        unexpected.msgtype(),
                        "command response prelude",
                    );
                    return Poll::Ready(Err(self.violation(violation)));
                },
            }
        }
    }

    /// Discard the rest of the current result.
    fn poll_drain_result(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            let event = ready!(self.poll_event(cx));
            let message = match event {
                SlotEvent::Complete(Err(broken)) => {
                    self.state = ReaderState::Closed;
                    return Poll::Ready(Err(broken.into()));
                },
                SlotEvent::Complete(Ok(_)) => {
                    self.state = ReaderState::Exhausted;
                    return Poll::Ready(match self.error.clone() {
                        Some(db) => Err(db.into()),
                        None => Ok(()),
                    });
                },
                SlotEvent::Message(message) => message,
            };
            match message {
                BackendMessage::DataRow(_) => {},
                BackendMessage::CommandComplete(tag) => {
                    self.rows_affected = tag.rows_affected();
                    self.state = ReaderState::Completed;
                    return Poll::Ready(Ok(()));
                },
                BackendMessage::EmptyQueryResponse(_) | BackendMessage::PortalSuspended(_) => {
                    self.state = ReaderState::Completed;
                    return Poll::Ready(Ok(()));
                },
                BackendMessage::ErrorResponse(response) => {
                    let db = match response.to_db_error() {
                        Ok(db) => db,
                        Err(violation) => return Poll::Ready(Err(self.violation(violation))),
                    };
                    self.error = Some(db.clone());
                    self.state = ReaderState::Completed;
                    return Poll::Ready(Err(db.into()));
                },
                unexpected => {
                    let violation = ProtocolError::unexpected_phase(
                        unexpected.msgtype(),
                        "draining result",
                    );
                    return Poll::Ready(Err(self.violation(violation)));
                },
            }
        }
    }

    /// Wait for the slot's terminal event after the last statement.
    fn poll_finish(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        loop {
            if self.drained {
                if let Some(broken) = &self.broken {
                    self.state = ReaderState::Closed;
                    return Poll::Ready(Err(broken.clone().into()));
                }
                self.state = ReaderState::Exhausted;
                return Poll::Ready(Ok(()));
            }
            let _ = ready!(self.poll_event(cx));
        }
    }

    fn poll_event(&mut self, cx: &mut Context) -> Poll<SlotEvent> {
        if let Some(message) = self.pending.take() {
            return Poll::Ready(SlotEvent::Message(message));
        }
        let event = ready!(self.handle.poll_event(cx));
        if let SlotEvent::Complete(result) = &event {
            self.drained = true;
            match result {
                Ok(status) => self.final_status = Some(*status),
                Err(broken) => self.broken = Some(broken.clone()),
            }
        }
        Poll::Ready(event)
    }

    /// The response stream made no sense: the reader is done and the whole
    /// session must break, since its framing can no longer be trusted.
    fn violation(&mut self, violation: ProtocolError) -> Error {
        self.state = ReaderState::Closed;
        self.session.break_with(BrokenError::new(&violation));
        violation.into()
    }

    fn enter_statement(&mut self, index: usize) {
        self.stmt_index = index;
        self.columns = None;
        self.param_oids = None;
        self.row = None;
        self.rows_affected = -1;
        self.has_rows = false;
        self.prelude = match self.plan.kind {
            CommandKind::Simple => Prelude::SimpleHead,
            CommandKind::Extended => match (index, self.plan.closes) {
                (0, remaining) if remaining > 0 => Prelude::Closes { remaining },
                _ => self.first_step(),
            },
        };
    }

    fn first_step(&self) -> Prelude {
        let statement = &self.plan.statements[self.stmt_index];
        if statement.parse {
            Prelude::Parse
        } else if self.plan.schema_only {
            Prelude::ParamDesc
        } else {
            Prelude::Bind
        }
    }

    fn after_bind(&mut self) -> Prelude {
        let statement = &self.plan.statements[self.stmt_index];
        if statement.describe {
            return Prelude::RowDesc;
        }
        if let Some(RowLayout::Columns(columns)) = &statement.row {
            self.columns = Some(columns.clone());
        }
        Prelude::Peek
    }

    fn after_row_description(&mut self) -> Prelude {
        if self.plan.schema_only {
            // metadata is the whole result
            self.state = ReaderState::Completed;
            return Prelude::Done;
        }
        Prelude::Peek
    }
}

impl std::fmt::Debug for CommandReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReader")
            .field("state", &self.state)
            .field("statement", &self.stmt_index)
            .field("field_count", &self.field_count())
            .field("has_rows", &self.has_rows)
            .field("rows_affected", &self.rows_affected)
            .finish()
    }
}

pin_project_lite::pin_project! {
    /// Stream over the raw rows of the current result.
    ///
    /// Returned from [`CommandReader::rows`].
    #[must_use = "streams do nothing unless polled"]
    pub struct RowStream<'a> {
        reader: &'a mut CommandReader,
    }
}

impl Stream for RowStream<'_> {
    type Item = Result<DataRow>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match ready!(this.reader.poll_read(cx)) {
            Ok(true) => match this.reader.take_row() {
                Some(row) => Poll::Ready(Some(Ok(row))),
                None => Poll::Ready(None),
            },
            Ok(false) => Poll::Ready(None),
            Err(err) => Poll::Ready(Some(Err(err))),
        }
    }
}
