//! Parameter values for the Bind step.
//!
//! The engine does not know how to encode user types; it carries opaque
//! writer callbacks with declared lengths, which is exactly what Bind
//! length precomputation needs.
use bytes::{BufMut, BytesMut};

use crate::postgres::PgFormat;

/// Declared length of a value not yet measured.
pub const LENGTH_UNKNOWN: i32 = -1;

type ParamWrite = Box<dyn FnOnce(&mut BytesMut) + Send + 'static>;

/// One Bind parameter: type oid, wire format, declared length, and the
/// writer that must emit exactly that many bytes.
///
/// The declared length is net of the 4-byte length prefix, which the
/// framing layer writes.
pub struct Param {
    oid: u32,
    format: PgFormat,
    len: i32,
    write: Option<ParamWrite>,
}

impl Param {
    /// A parameter with an opaque writer.
    ///
    /// `len` must be the exact byte count `write` will produce, or
    /// [`LENGTH_UNKNOWN`] if not yet measured; an unknown length at Bind
    /// time fails with [`BindError::LengthRequired`] before any bytes are
    /// buffered.
    pub fn new(
        oid: u32,
        format: PgFormat,
        len: i32,
        write: impl FnOnce(&mut BytesMut) + Send + 'static,
    ) -> Param {
        Param { oid, format, len, write: Some(Box::new(write)) }
    }

    /// An SQL NULL of the given type.
    pub fn null(oid: u32) -> Param {
        Param { oid, format: PgFormat::Binary, len: LENGTH_UNKNOWN, write: None }
    }

    /// A binary int4 parameter.
    pub fn int4(value: i32) -> Param {
        Param::new(oids::INT4, PgFormat::Binary, 4, move |buf| {
            buf.put_i32(value);
        })
    }

    /// A binary int8 parameter.
    pub fn int8(value: i64) -> Param {
        Param::new(oids::INT8, PgFormat::Binary, 8, move |buf| {
            buf.put_i64(value);
        })
    }

    /// A text parameter.
    pub fn text(value: impl Into<String>) -> Param {
        let value = value.into();
        let len = i32::try_from(value.len()).expect("parameter too large for protocol");
        Param::new(oids::TEXT, PgFormat::Text, len, move |buf| {
            buf.put_slice(value.as_bytes());
        })
    }

    pub fn oid(&self) -> u32 {
        self.oid
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// Declared value length, [`LENGTH_UNKNOWN`] when not yet measured.
    pub fn declared_len(&self) -> i32 {
        self.len
    }

    pub fn is_null(&self) -> bool {
        self.write.is_none()
    }

    pub(crate) fn into_parts(self) -> (i32, Option<ParamWrite>) {
        (self.len, self.write)
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Param")
            .field("oid", &self.oid)
            .field("format", &self.format)
            .field("len", &self.len)
            .field("null", &self.is_null())
            .finish()
    }
}

/// An invalid parameter batch, detected while precomputing or streaming a
/// Bind message.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("parameter {index} has no declared length")]
    LengthRequired {
        index: usize,
    },
    #[error("parameter {index} declared {declared} bytes but wrote {actual}")]
    LengthMismatch {
        index: usize,
        declared: i32,
        actual: usize,
    },
}

/// The few type oids the engine itself needs.
///
/// Full type mapping belongs to the encoder/decoder collaborators.
pub mod oids {
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
}
