//! Command values: what a caller submits to a session.
use std::time::Duration;

use crate::{
    Result,
    common::SizedStr,
    encode::Param,
    error::ArgumentError,
    statement::RowLayout,
};

/// How a command wants to be executed.
///
/// A small bitset rather than an enum: flags combine (`PREPARING |
/// SINGLE_ROW`), and contradictory combinations are rejected by
/// validation before any I/O.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionFlags(u16);

impl ExecutionFlags {
    /// Prepare through the session statement cache, full row stream.
    pub const DEFAULT: ExecutionFlags = ExecutionFlags(0);
    /// Require the statement cache; behaves as [`PREPARING`][Self::PREPARING]
    /// on a cache miss.
    pub const PREPARED: ExecutionFlags = ExecutionFlags(1);
    /// Prepare and cache the statement as part of this execution.
    pub const PREPARING: ExecutionFlags = ExecutionFlags(1 << 1);
    /// Bypass the statement cache; parameterless single statements go
    /// through the simple query protocol.
    pub const UNPREPARED: ExecutionFlags = ExecutionFlags(1 << 2);
    /// Fetch result metadata only; no rows are executed.
    pub const SCHEMA_ONLY: ExecutionFlags = ExecutionFlags(1 << 3);
    /// Request key column information from the metadata consumers.
    ///
    /// Carried on the command record for the reader's collaborators; the
    /// wire flow is unaffected.
    pub const KEY_INFO: ExecutionFlags = ExecutionFlags(1 << 4);
    /// Stop the portal after one row.
    pub const SINGLE_ROW: ExecutionFlags = ExecutionFlags(1 << 5);

    pub fn contains(self, other: ExecutionFlags) -> bool {
        self.0 & other.0 == other.0
    }

    fn intersects(self, other: ExecutionFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub(crate) fn validate(self) -> Result<(), ArgumentError> {
        if self.contains(Self::UNPREPARED) && self.intersects(ExecutionFlags(Self::PREPARED.0 | Self::PREPARING.0)) {
            return Err(ArgumentError::FlagConflict("UNPREPARED with PREPARED/PREPARING"));
        }
        if self.contains(Self::SCHEMA_ONLY) && self.contains(Self::SINGLE_ROW) {
            return Err(ArgumentError::FlagConflict("SCHEMA_ONLY with SINGLE_ROW"));
        }
        Ok(())
    }
}

impl std::ops::BitOr for ExecutionFlags {
    type Output = ExecutionFlags;

    fn bitor(self, rhs: ExecutionFlags) -> ExecutionFlags {
        ExecutionFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for ExecutionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (flag, name) in [
            (Self::PREPARED, "PREPARED"),
            (Self::PREPARING, "PREPARING"),
            (Self::UNPREPARED, "UNPREPARED"),
            (Self::SCHEMA_ONLY, "SCHEMA_ONLY"),
            (Self::KEY_INFO, "KEY_INFO"),
            (Self::SINGLE_ROW, "SINGLE_ROW"),
        ] {
            if self.contains(flag) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// One SQL statement and its bound parameters.
#[derive(Debug)]
pub struct Statement {
    pub(crate) sql: SizedStr,
    pub(crate) params: Vec<Param>,
}

impl Statement {
    fn new(sql: impl Into<SizedStr>) -> Self {
        Self { sql: sql.into(), params: Vec::new() }
    }
}

/// A command to submit: one or more statements, execution flags, and an
/// optional timeout.
///
/// A multi-statement command is a *batch*: every statement is written
/// before a single trailing Sync, so the statements pipeline server side
/// and a failure in one skips the rest up to that Sync.
pub struct Command {
    statements: Vec<Statement>,
    flags: ExecutionFlags,
    timeout: Option<Duration>,
}

impl Command {
    /// An extended-protocol command with the default flags.
    pub fn new(sql: impl Into<SizedStr>) -> Command {
        Command {
            statements: vec![Statement::new(sql)],
            flags: ExecutionFlags::DEFAULT,
            timeout: None,
        }
    }

    /// A simple-protocol command.
    ///
    /// The SQL may contain multiple semicolon separated statements; the
    /// server splits them and the reader walks the results with
    /// `next_result`.
    pub fn simple(sql: impl Into<SizedStr>) -> Command {
        Command::new(sql).flags(ExecutionFlags::UNPREPARED)
    }

    pub fn flags(mut self, flags: ExecutionFlags) -> Command {
        self.flags = flags;
        self
    }

    /// Bind a parameter to the last statement.
    pub fn bind(mut self, param: Param) -> Command {
        if let Some(statement) = self.statements.last_mut() {
            statement.params.push(param);
        }
        self
    }

    /// Append another statement to the batch.
    pub fn batch(mut self, sql: impl Into<SizedStr>) -> Command {
        self.statements.push(Statement::new(sql));
        self
    }

    /// Override the data source command timeout for this command.
    pub fn timeout(mut self, timeout: Duration) -> Command {
        self.timeout = Some(timeout);
        self
    }

    /// Snapshot into an immutable record, validating everything that must
    /// fail before I/O: flag conflicts, empty commands, missing parameter
    /// lengths.
    pub(crate) fn into_values(mut self) -> Result<CommandValues> {
        self.flags.validate()?;
        if self.statements.is_empty() {
            return Err(ArgumentError::EmptyCommand.into());
        }

        let mut params_total = 0;
        for statement in &mut self.statements {
            statement.sql.ensure_sized();
            params_total += statement.params.len();
            for (index, param) in statement.params.iter().enumerate() {
                if !param.is_null() && param.declared_len() < 0 {
                    return Err(crate::encode::BindError::LengthRequired { index }.into());
                }
            }
        }

        let kind = if self.flags.contains(ExecutionFlags::UNPREPARED)
            && self.statements.len() == 1
            && params_total == 0
            && !self.flags.contains(ExecutionFlags::SCHEMA_ONLY)
        {
            CommandKind::Simple
        } else {
            CommandKind::Extended
        };

        Ok(CommandValues {
            kind,
            statements: self.statements,
            flags: self.flags,
            timeout: self.timeout,
        })
    }
}

/// Wire flow of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandKind {
    /// One `Query` message; results delimited by CommandComplete.
    Simple,
    /// Parse/Bind/Describe/Execute per statement, one trailing Sync.
    Extended,
}

/// Immutable snapshot of a [`Command`], taken before the first suspension
/// point of a submit.
#[derive(Debug)]
pub(crate) struct CommandValues {
    pub kind: CommandKind,
    pub statements: Vec<Statement>,
    pub flags: ExecutionFlags,
    pub timeout: Option<Duration>,
}

/// What the reader should expect for one slot, fixed at write time.
#[derive(Debug)]
pub(crate) struct SlotPlan {
    pub kind: CommandKind,
    pub schema_only: bool,
    /// CloseComplete messages preceding the first statement's responses.
    pub closes: usize,
    pub statements: Vec<StmtPlan>,
}

/// Response shape of one extended statement.
#[derive(Debug)]
pub(crate) struct StmtPlan {
    /// Parse was sent; a ParseComplete will arrive.
    pub parse: bool,
    /// Describe was sent; a RowDescription or NoData will arrive.
    pub describe: bool,
    /// Known layout when Describe was skipped.
    pub row: Option<RowLayout>,
}
