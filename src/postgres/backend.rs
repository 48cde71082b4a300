//! Postgres Backend Messages
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::{common::ByteStr, ext::BytesExt};

use super::error::{DatabaseError, ProtocolError};

/// A type that can be decoded from a postgres backend message
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    NotificationResponse(NotificationResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    NotificationResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

impl BackendMessage {
    /// Messages that may appear at any point between protocol messages and
    /// never advance command state.
    pub fn is_async(msgtype: u8) -> bool {
        matches!(
            msgtype,
            NoticeResponse::MSGTYPE | NotificationResponse::MSGTYPE | ParameterStatus::MSGTYPE
        )
    }

    /// The message name for diagnostics.
    pub fn name(&self) -> &'static str {
        macro_rules! name {
            ($($variant:ident,)*) => {
                match self { $(Self::$variant(_) => stringify!($variant),)* }
            };
        }
        name! {
            Authentication, BackendKeyData, BindComplete, CloseComplete,
            CommandComplete, DataRow, EmptyQueryResponse, ErrorResponse,
            NegotiateProtocolVersion, NoData, NoticeResponse,
            NotificationResponse, ParameterDescription, ParameterStatus,
            ParseComplete, PortalSuspended, ReadyForQuery, RowDescription,
        }
    }
}

macro_rules! assert_msgtype {
    ($self:ident,$typ:ident) => {
        if $self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(stringify!($self), $typ))
        }
    };
}

macro_rules! need {
    ($name:ident, $body:ident, $n:expr) => {
        if $body.remaining() < $n {
            return Err(ProtocolError::truncated(stringify!($name)));
        }
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Int32(0) Specifies that the authentication was successful.
    Ok,
    /// Int32(2) Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Int32(3) Specifies that a clear-text password is required.
    CleartextPassword,
    /// Int32(5) Specifies that an MD5-encrypted password is required.
    /// Byte4 The salt to use when encrypting the password.
    MD5Password {
        salt: [u8; 4],
    },
    /// Int32(7) Specifies that GSSAPI authentication is required.
    GSS,
    /// Int32(9) Specifies that SSPI authentication is required.
    SSPI,
    /// Int32(10) Specifies that SASL authentication is required.
    ///
    /// The body is a list of SASL mechanism names, in the server's order of
    /// preference, each nul terminated, with a trailing nul.
    SASL {
        mechanisms: Bytes,
    },
    /// Int32(11) SASL challenge data.
    SASLContinue {
        data: Bytes,
    },
    /// Int32(12) SASL outcome additional data.
    SASLFinal {
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(Authentication, msgtype);
        need!(Authentication, body, 4);
        let auth = match body.get_i32() {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => {
                need!(Authentication, body, 4);
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Authentication::MD5Password { salt }
            },
            7 => Authentication::GSS,
            9 => Authentication::SSPI,
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: i32,
    /// The secret key of this backend.
    pub secret_key: i32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(BackendKeyData, msgtype);
        need!(BackendKeyData, body, 8);
        Ok(Self {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported
    pub name: ByteStr,
    /// The current value of the parameter
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterStatus, msgtype);
        Ok(Self {
            name: body.get_nul_bytestr()?,
            value: body.get_nul_bytestr()?,
        })
    }
}

/// A warning message. The fields mirror [`ErrorResponse`].
#[derive(Debug)]
pub struct NoticeResponse {
    pub fields: DatabaseError,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NoticeResponse, msgtype);
        Ok(Self { fields: DatabaseError::from_fields(body)? })
    }
}

/// Identifies the message as a notification from `NOTIFY`.
#[derive(Debug, Clone)]
pub struct NotificationResponse {
    /// The process ID of the notifying backend process.
    pub process_id: i32,
    /// The name of the channel that the notify has been raised on.
    pub channel: ByteStr,
    /// The “payload” string passed from the notifying process.
    pub payload: ByteStr,
}

impl NotificationResponse {
    pub const MSGTYPE: u8 = b'A';
}

impl BackendProtocol for NotificationResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NotificationResponse, msgtype);
        need!(NotificationResponse, body, 4);
        Ok(Self {
            process_id: body.get_i32(),
            channel: body.get_nul_bytestr()?,
            payload: body.get_nul_bytestr()?,
        })
    }
}

/// Identifies the message as an error.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator. Fields can appear in any order.
#[derive(Debug)]
pub struct ErrorResponse {
    pub body: Bytes,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    pub fn to_db_error(&self) -> Result<DatabaseError, ProtocolError> {
        DatabaseError::from_fields(self.body.clone())
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ErrorResponse, msgtype);
        Ok(Self { body })
    }
}

/// One column of a [`RowDescription`].
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// The field name.
    pub name: ByteStr,
    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub table_oid: u32,
    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: u32,
    /// The data type size (see pg_type.typlen).
    /// Note that negative values denote variable-width types.
    pub type_size: i16,
    /// The type modifier (see pg_attribute.atttypmod).
    pub type_modifier: i32,
    /// The format code being used for the field, zero (text) or one (binary).
    pub format: i16,
}

/// Identifies the message as a row description
#[derive(Debug, Clone)]
pub struct RowDescription {
    pub columns: Arc<[ColumnInfo]>,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(RowDescription, msgtype);
        need!(RowDescription, body, 2);

        // Specifies the number of fields in a row (can be zero).
        let fields = body.get_i16();
        let mut columns = Vec::with_capacity(fields.max(0) as usize);

        for _ in 0..fields {
            let name = body.get_nul_bytestr()?;
            need!(RowDescription, body, 4 + 2 + 4 + 2 + 4 + 2);
            columns.push(ColumnInfo {
                name,
                table_oid: body.get_u32(),
                column_attr: body.get_i16(),
                type_oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }

        Ok(Self { columns: columns.into() })
    }
}

/// Identifies the message as a data row.
///
/// The column values are kept raw; slicing them out is left to the
/// row decoder collaborator via [`columns`][DataRow::columns].
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub field_len: i16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';

    /// Iterate the column values; `None` is an SQL NULL.
    pub fn columns(&self) -> DataRowColumns {
        DataRowColumns { body: self.body.clone(), remaining: self.field_len }
    }
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(DataRow, msgtype);
        need!(DataRow, body, 2);
        let field_len = body.get_i16();
        Ok(Self { field_len, body })
    }
}

/// Iterator over the raw column values of one [`DataRow`].
#[derive(Debug)]
pub struct DataRowColumns {
    body: Bytes,
    remaining: i16,
}

impl Iterator for DataRowColumns {
    type Item = Result<Option<Bytes>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.body.remaining() < 4 {
            self.remaining = 0;
            return Some(Err(ProtocolError::truncated("DataRow")));
        }
        // Int32 The length of the column value, in bytes (this count does
        // not include itself). As a special case, -1 indicates a NULL
        // column value. No value bytes follow in the NULL case.
        let len = self.body.get_i32();
        if len < 0 {
            return Some(Ok(None));
        }
        if self.body.remaining() < len as usize {
            self.remaining = 0;
            return Some(Err(ProtocolError::truncated("DataRow")));
        }
        Some(Ok(Some(self.body.split_to(len as usize))))
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which
    /// SQL command was completed, e.g. `SELECT 3` or `INSERT 0 14`.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Rows affected by a modifying statement, `-1` for statements that do
    /// not report a modification count (such as `SELECT` or DDL).
    pub fn rows_affected(&self) -> i64 {
        let mut words = self.tag.split_whitespace();
        let Some(tag) = words.next() else {
            return -1;
        };
        let count = match tag {
            // INSERT oid rows, the oid is always zero nowadays
            "INSERT" => words.nth(1),
            "UPDATE" | "DELETE" | "MERGE" | "COPY" => words.next(),
            _ => return -1,
        };
        count.and_then(|c| c.parse().ok()).unwrap_or(-1)
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(CommandComplete, msgtype);
        Ok(Self { tag: body.get_nul_bytestr()? })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major
    /// protocol version requested by the client.
    pub minor: i32,
    /// Number of protocol options not recognized by the server.
    pub unsupported_options: i32,
    /// The option names, each nul terminated.
    pub options: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(NegotiateProtocolVersion, msgtype);
        need!(NegotiateProtocolVersion, body, 8);
        Ok(Self {
            minor: body.get_i32(),
            unsupported_options: body.get_i32(),
            options: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The object ID of each parameter data type used by the statement.
    pub oids: Vec<u32>,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ParameterDescription, msgtype);
        need!(ParameterDescription, body, 2);
        let len = body.get_i16();
        let mut oids = Vec::with_capacity(len.max(0) as usize);
        for _ in 0..len {
            need!(ParameterDescription, body, 4);
            oids.push(body.get_u32());
        }
        Ok(Self { oids })
    }
}

/// Transaction state reported by [`ReadyForQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `I`, idle, not in a transaction block.
    Idle,
    /// `T`, in a transaction block.
    InTransaction,
    /// `E`, in a failed transaction block; queries will be rejected until
    /// the block is ended.
    InFailedTransaction,
}

/// ReadyForQuery is sent whenever the backend is ready for a new query cycle.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(ReadyForQuery, msgtype);
        need!(ReadyForQuery, body, 1);
        let status = match body.get_u8() {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InFailedTransaction,
            other => return Err(ProtocolError::unexpected_phase(other, "reading transaction status")),
        };
        Ok(Self { status })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(stringify!($name), msgtype))
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, Bytes, BytesMut};

    use super::{BackendProtocol, CommandComplete, DataRow, RowDescription};

    fn tag(s: &str) -> CommandComplete {
        let mut buf = BytesMut::new();
        buf.put(s.as_bytes());
        buf.put_u8(0);
        CommandComplete::decode(b'C', buf.freeze()).unwrap()
    }

    #[test]
    fn command_complete_rows() {
        assert_eq!(tag("SELECT 3").rows_affected(), -1);
        assert_eq!(tag("INSERT 0 14").rows_affected(), 14);
        assert_eq!(tag("UPDATE 7").rows_affected(), 7);
        assert_eq!(tag("DELETE 0").rows_affected(), 0);
        assert_eq!(tag("CREATE TABLE").rows_affected(), -1);
        assert_eq!(tag("BEGIN").rows_affected(), -1);
    }

    #[test]
    fn data_row_columns() {
        let mut buf = BytesMut::new();
        buf.put_i16(3);
        buf.put_i32(4);
        buf.put_i32(8); // int4 value 8
        buf.put_i32(-1); // NULL
        buf.put_i32(2);
        buf.put_slice(b"ok");

        let row = DataRow::decode(b'D', buf.freeze()).unwrap();
        let cols = row.columns().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].as_deref(), Some(&8i32.to_be_bytes()[..]));
        assert_eq!(cols[1], None);
        assert_eq!(cols[2].as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn data_row_truncated() {
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        buf.put_i32(100); // declared longer than body
        buf.put_slice(b"abc");

        let row = DataRow::decode(b'D', buf.freeze()).unwrap();
        assert!(row.columns().next().unwrap().is_err());
    }

    #[test]
    fn row_description_fields() {
        let mut buf = BytesMut::new();
        buf.put_i16(2);
        for (name, oid) in [("id", 23u32), ("label", 25)] {
            buf.put(name.as_bytes());
            buf.put_u8(0);
            buf.put_u32(0); // table oid
            buf.put_i16(0); // attr
            buf.put_u32(oid);
            buf.put_i16(4);
            buf.put_i32(-1);
            buf.put_i16(1);
        }

        let rd = RowDescription::decode(b'T', buf.freeze()).unwrap();
        assert_eq!(rd.columns.len(), 2);
        assert_eq!(&*rd.columns[0].name, "id");
        assert_eq!(rd.columns[1].type_oid, 25);
    }

    #[test]
    fn unknown_message_rejected() {
        assert!(super::BackendMessage::decode(b'?', Bytes::new()).is_err());
    }
}
