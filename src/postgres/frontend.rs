//! Postgres Frontend Messages
//!
//! All struct fields here mirror the actual message sent to postgres.
use bytes::{BufMut, BytesMut};

use crate::{
    common::SizedStr,
    encode::{BindError, Param},
    ext::{BufMutExt, StrExt, UsizeExt},
};

use super::PgFormat;

// Other Frontend Message:
// CopyData('d')
// CopyDone('c')
// CopyFail('f')
// FunctionCall('F')
// GSSENCRequest
// GSSENCResponse('p')
// SASLInitialResponse('p')
// SASLResponse('p')
// SSLRequest

/// write a frontend message to `buf`
pub fn write<F: FrontendProtocol>(msg: F, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(F::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "[BUG] Frontend Message body not equal to size hint"
    );
}

/// A type which can be encoded into postgres frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
///
/// Thus, [`Startup`] and [`CancelRequest`] do not implement [`FrontendProtocol`]
pub trait FrontendProtocol {
    /// message type
    const MSGTYPE: u8;

    /// size of the main body
    ///
    /// note that this is *only* the size of main body as oppose of actual postgres message
    fn size_hint(&self) -> i32;

    /// write the main body of the message
    ///
    /// `buf` have the length returned from `size_hint`
    ///
    /// writing less or past length results in panic
    fn encode(self, buf: impl BufMut);
}

/// Postgres Startup frontend message
///
/// For historical reasons, the very first message sent by the client (the startup message)
/// has no initial message-type byte.
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as. Required; there is no default.
    pub user: &'a str,
    /// The database to connect to. Defaults to the user name.
    pub database: Option<&'a str>,
    /// Used to connect in streaming replication mode, where a small set of
    /// replication commands can be issued instead of SQL statements.
    ///
    /// Value can be true, false, or database, and the default is false.
    pub replication: Option<&'a str>,
}

impl Startup<'_> {
    /// Int32(196608)
    ///
    /// The most significant 16 bits are the major version number (3 for the protocol described here).
    /// The least significant 16 bits are the minor version number (0 for the protocol described here).
    pub const PROTOCOL_VERSION: i32 = 196608;

    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        buf.put_i32(Self::PROTOCOL_VERSION);

        // The protocol version number is followed by one or more pairs of parameter name and value strings.

        buf.put_nul_string("user");
        buf.put_nul_string(self.user);

        if let Some(db) = self.database {
            buf.put_nul_string("database");
            buf.put_nul_string(db);
        }

        if let Some(repl) = self.replication {
            buf.put_nul_string("replication");
            buf.put_nul_string(repl);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let mut written_buf = &mut buf[offset..];
        let len = written_buf.len().to_i32();
        written_buf.put_i32(len);
    }
}

/// Requests cancellation of a query currently in progress on a session.
///
/// Sent on a *new* connection, not the one running the query, and framed
/// like [`Startup`]: no message-type byte.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    /// The process ID of the target backend.
    pub process_id: i32,
    /// The secret key for the target backend.
    pub secret_key: i32,
}

impl CancelRequest {
    /// Int32(80877102)
    ///
    /// The cancel request code, chosen to not match any protocol version.
    pub const CODE: i32 = 80877102;

    pub fn write(self, buf: &mut BytesMut) {
        // Int32(16) Length of message contents in bytes, including self.
        buf.put_i32(16);
        buf.put_i32(Self::CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Identifies the message as a password response
#[derive(Debug)]
pub struct PasswordMessage<'a> {
    /// The password (encrypted, if requested)
    pub password: &'a str,
}

impl FrontendProtocol for PasswordMessage<'_> {
    const MSGTYPE: u8 = b'p';

    fn size_hint(&self) -> i32 {
        self.password.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.password);
    }
}

/// Identifies the message as a simple query
pub struct Query<'a> {
    /// the query string itself
    pub sql: &'a SizedStr,
}

impl FrontendProtocol for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        self.sql.nul_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.sql.as_str());
    }
}

/// Identifies the message as a Parse command
pub struct Parse<'a> {
    /// prepared statement name (an empty string selects the unnamed prepared statement).
    pub statement: &'a str,
    /// The query string to be parsed.
    pub sql: &'a SizedStr,
    /// Specifies the object ID of the parameter data type.
    ///
    /// Placing a zero here is equivalent to leaving the type unspecified.
    pub param_oids: &'a [u32],
}

impl FrontendProtocol for Parse<'_> {
    const MSGTYPE: u8 = b'P';

    fn size_hint(&self) -> i32 {
        self.statement.nul_string_len()
            + self.sql.nul_len()
            + 2
            + self.param_oids.len().to_i32() * 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.statement);
        buf.put_nul_string(self.sql.as_str());
        buf.put_u16(self.param_oids.len().to_u16());
        for oid in self.param_oids {
            buf.put_u32(*oid);
        }
    }
}

/// Identifies the message as a Sync command
pub struct Sync;

impl FrontendProtocol for Sync {
    const MSGTYPE: u8 = b'S';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Flush command
pub struct Flush;

impl FrontendProtocol for Flush {
    const MSGTYPE: u8 = b'H';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a termination
pub struct Terminate;

impl FrontendProtocol for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// Identifies the message as a Execute command
pub struct Execute<'a> {
    /// The name of the portal to execute (an empty string selects the unnamed portal).
    pub portal: &'a str,
    /// Maximum number of rows to return, if portal contains a query that returns rows
    /// (ignored otherwise). Zero denotes “no limit”.
    pub max_rows: i32,
}

impl FrontendProtocol for Execute<'_> {
    const MSGTYPE: u8 = b'E';

    fn size_hint(&self) -> i32 {
        self.portal.nul_string_len() + 4
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_string(self.portal);
        buf.put_i32(self.max_rows);
    }
}

/// Identifies the message as a Close command
pub struct Close<'a> {
    /// 'S' to close a prepared statement; or 'P' to close a portal.
    pub variant: u8,
    /// The name of the prepared statement or portal to close
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Close<'_> {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.variant);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Describe command.
pub struct Describe<'a> {
    /// 'S' to describe a prepared statement; or 'P' to describe a portal.
    pub kind: u8,
    /// The name of the prepared statement or portal to describe
    /// (an empty string selects the unnamed prepared statement or portal).
    pub name: &'a str,
}

impl FrontendProtocol for Describe<'_> {
    const MSGTYPE: u8 = b'D';

    fn size_hint(&self) -> i32 {
        1 + self.name.nul_string_len()
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.kind);
        buf.put_nul_string(self.name);
    }
}

/// Identifies the message as a Bind command.
///
/// Unlike the other frontend messages, Bind is written through its own
/// fallible [`write`][Bind::write]: the body length must be precomputed from
/// every parameter's declared length before the header goes out, and each
/// parameter writer is verified against its declaration as it runs.
pub struct Bind<'a> {
    /// The name of the destination portal (an empty string selects the unnamed portal).
    pub portal: &'a str,
    /// The name of the source prepared statement (an empty string selects the unnamed prepared statement).
    pub statement: &'a str,
    /// The parameter values, each carrying its declared length and writer.
    pub params: Vec<Param>,
    /// The format requested for all result columns.
    pub result_format: PgFormat,
}

impl Bind<'_> {
    pub const MSGTYPE: u8 = b'B';

    /// Exact body length:
    ///
    /// ```text
    /// cstring(portal) + cstring(statement)
    ///   + 2 + (uniform ? 2 : 2·N)     parameter format codes
    ///   + 2 + Σ(4 + declared_len_i)   parameter values (NULL contributes 4)
    ///   + 2 + 2                       single result format code
    /// ```
    fn size_hint(&self) -> Result<i32, BindError> {
        let mut size = self.portal.nul_string_len()
            + self.statement.nul_string_len()
            + 2
            + if self.uniform_format() { 2 } else { self.params.len().to_i32() * 2 }
            + 2;

        for (index, param) in self.params.iter().enumerate() {
            if param.is_null() {
                size += 4;
                continue;
            }
            let len = param.declared_len();
            if len < 0 {
                return Err(BindError::LengthRequired { index });
            }
            size += 4 + len;
        }

        Ok(size + 2 + 2)
    }

    fn uniform_format(&self) -> bool {
        self.params.windows(2).all(|w| w[0].format() == w[1].format())
    }

    /// Precompute the length, then stream the message into `buf`.
    ///
    /// On error nothing of the message remains in `buf`: declared lengths
    /// are validated before the header is written, and a writer that
    /// produces a different byte count than it declared truncates the
    /// message away before returning [`BindError::LengthMismatch`].
    pub fn write(self, buf: &mut BytesMut) -> Result<(), BindError> {
        let size = self.size_hint()?;
        let start = buf.len();
        buf.reserve(1 + 4 + size as usize);

        buf.put_u8(Self::MSGTYPE);
        buf.put_i32(4 + size);

        buf.put_nul_string(self.portal);
        buf.put_nul_string(self.statement);

        if self.uniform_format() {
            let format = self.params.first().map(Param::format).unwrap_or_default();
            buf.put_i16(1);
            buf.put_i16(format.format_code());
        } else {
            buf.put_i16(self.params.len().to_u16() as i16);
            for param in &self.params {
                buf.put_i16(param.format().format_code());
            }
        }

        buf.put_i16(self.params.len().to_u16() as i16);
        for (index, param) in self.params.into_iter().enumerate() {
            let (declared, write) = param.into_parts();
            let Some(write) = write else {
                // NULL parameter value, no bytes follow
                buf.put_i32(-1);
                continue;
            };
            buf.put_i32(declared);
            let at = buf.len();
            write(buf);
            let actual = buf.len() - at;
            if actual != declared as usize {
                buf.truncate(start);
                return Err(BindError::LengthMismatch { index, declared, actual });
            }
        }

        buf.put_i16(1);
        buf.put_i16(self.result_format.format_code());

        debug_assert_eq!(
            buf.len() - start,
            1 + 4 + size as usize,
            "[BUG] Bind body not equal to precomputed length"
        );

        Ok(())
    }
}
