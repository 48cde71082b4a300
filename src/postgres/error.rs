//! Protocol and server error types.
use bytes::Bytes;

use crate::{common::ByteStr, ext::BytesExt};

/// An error when translating buffer from postgres.
///
/// Any of these means the byte stream can no longer be trusted; the
/// session that produced one is broken.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message {found:?}{}{}",
        fmt_expect(.expect), fmt_phase(.phase))]
    Unexpected {
        expect: Option<&'static str>,
        found: char,
        phase: Option<&'static str>,
    },
    #[error("unknown authentication method ({auth})")]
    UnknownAuth {
        auth: i32,
    },
    #[error("message {message} truncated")]
    Truncated {
        message: &'static str,
    },
    #[error("invalid message length {len} for {found:?}")]
    BadLength {
        found: char,
        len: i32,
    },
    #[error("string field is not nul terminated")]
    MissingNul,
    #[error("non utf8 string field")]
    NonUtf8(#[from] std::str::Utf8Error),
    #[error("stream closed mid message")]
    UnexpectedEof,
}

fn fmt_expect(expect: &Option<&'static str>) -> String {
    match expect {
        Some(e) => format!(", expecting {e}"),
        None => String::new(),
    }
}

fn fmt_phase(phase: &Option<&'static str>) -> String {
    match phase {
        Some(p) => format!(" while {p}"),
        None => String::new(),
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected { expect: None, found: found as char, phase: None }
    }

    pub(crate) fn unexpected(expect: &'static str, found: u8) -> ProtocolError {
        Self::Unexpected { expect: Some(expect), found: found as char, phase: None }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected { expect: None, found: found as char, phase: Some(phase) }
    }

    pub(crate) fn unknown_auth(auth: i32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn truncated(message: &'static str) -> ProtocolError {
        Self::Truncated { message }
    }

    pub(crate) fn bad_length(found: u8, len: i32) -> ProtocolError {
        Self::BadLength { found: found as char, len }
    }

    pub(crate) fn missing_nul() -> ProtocolError {
        Self::MissingNul
    }

    pub(crate) fn non_utf8(err: std::str::Utf8Error) -> ProtocolError {
        Self::NonUtf8(err)
    }

    pub(crate) fn eof() -> ProtocolError {
        Self::UnexpectedEof
    }
}

/// An error reported by the server through `ErrorResponse`.
///
/// The command that triggered it failed; the session stays usable once the
/// trailing `ReadyForQuery` is consumed.
#[derive(Clone, thiserror::Error)]
#[error("{severity}: {message} (SQLSTATE {code})")]
pub struct DatabaseError {
    severity: ByteStr,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<u32>,
}

/// SQLSTATE reported for a query canceled by user request.
pub(crate) const QUERY_CANCELED: &str = "57014";

impl DatabaseError {
    /// Parse the tagged field list of an `ErrorResponse` or
    /// `NoticeResponse` body.
    ///
    /// Fields can appear in any order; a zero byte terminates the list.
    /// Unrecognized field codes are skipped.
    pub(crate) fn from_fields(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut severity = ByteStr::default();
        let mut code = ByteStr::default();
        let mut message = ByteStr::default();
        let mut detail = None;
        let mut hint = None;
        let mut position = None;

        loop {
            if body.is_empty() {
                return Err(ProtocolError::truncated("ErrorResponse"));
            }
            use bytes::Buf;
            match body.get_u8() {
                0 => break,
                // prefer the non-localized severity when present
                b'V' => severity = body.get_nul_bytestr()?,
                b'S' => {
                    let s = body.get_nul_bytestr()?;
                    if severity.is_empty() {
                        severity = s;
                    }
                },
                b'C' => code = body.get_nul_bytestr()?,
                b'M' => message = body.get_nul_bytestr()?,
                b'D' => detail = Some(body.get_nul_bytestr()?),
                b'H' => hint = Some(body.get_nul_bytestr()?),
                b'P' => position = body.get_nul_bytestr()?.parse().ok(),
                _ => drop(body.get_nul_bytestr()?),
            }
        }

        Ok(Self { severity, code, message, detail, hint, position })
    }

    /// The SQLSTATE code, e.g. `22012` for division by zero.
    pub fn sqlstate(&self) -> &str {
        &self.code
    }

    pub fn severity(&self) -> &str {
        &self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// 1-based character index into the query where the error occured.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Whether this error is a user requested cancellation.
    pub fn is_query_canceled(&self) -> bool {
        self.code == QUERY_CANCELED
    }
}

impl std::fmt::Debug for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};

    use super::DatabaseError;

    fn field(buf: &mut BytesMut, code: u8, value: &str) {
        buf.put_u8(code);
        buf.put(value.as_bytes());
        buf.put_u8(0);
    }

    #[test]
    fn parse_fields() {
        let mut buf = BytesMut::new();
        field(&mut buf, b'S', "ERROR");
        field(&mut buf, b'V', "ERROR");
        field(&mut buf, b'C', "22012");
        field(&mut buf, b'M', "division by zero");
        field(&mut buf, b'F', "int.c"); // skipped
        field(&mut buf, b'P', "8");
        buf.put_u8(0);

        let err = DatabaseError::from_fields(buf.freeze()).unwrap();
        assert_eq!(err.sqlstate(), "22012");
        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.message(), "division by zero");
        assert_eq!(err.position(), Some(8));
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn truncated() {
        let mut buf = BytesMut::new();
        field(&mut buf, b'M', "no terminator follows");
        assert!(DatabaseError::from_fields(buf.freeze()).is_err());
    }
}
