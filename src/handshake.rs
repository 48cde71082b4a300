//! Startup phase: from raw duplex to an authenticated, Ready session.
//!
//! Trust and clear-text password authentication are handled here; anything
//! stronger (SCRAM, GSS, ...) belongs to an authenticating wrapper around
//! the duplex and surfaces as [`UnsupportedAuth`].
use std::collections::HashMap;

use crate::{
    Result,
    common::{ByteStr, verbose},
    config::Config,
    error::UnsupportedAuth,
    postgres::{
        BackendMessage, BackendProtocol, ProtocolError,
        backend::{Authentication, BackendKeyData, TransactionStatus},
        frontend,
    },
    stream::{ReadPipe, WritePipe},
};

pub(crate) struct Handshake {
    pub key: Option<BackendKeyData>,
    pub parameters: HashMap<ByteStr, ByteStr>,
    pub status: TransactionStatus,
}

pub(crate) async fn startup(
    write: &mut WritePipe,
    read: &mut ReadPipe,
    config: &Config,
) -> Result<Handshake> {
    write.send_startup(frontend::Startup {
        user: config.user.as_str(),
        database: Some(config.dbname.as_str()),
        replication: None,
    });
    write.flush().await?;

    let mut key = None;
    let mut parameters = HashMap::new();

    loop {
        let Some(msg) = read.read_message().await? else {
            return Err(ProtocolError::eof().into());
        };

        match BackendMessage::decode(msg.msgtype, msg.body)? {
            BackendMessage::Authentication(auth) => match auth {
                Authentication::Ok => {
                    verbose!("authentication ok");
                },
                Authentication::CleartextPassword => {
                    write.send(frontend::PasswordMessage { password: config.pass.as_str() });
                    write.flush().await?;
                },
                Authentication::KerberosV5 => {
                    return Err(UnsupportedAuth { method: "kerberos" }.into());
                },
                Authentication::MD5Password { .. } => {
                    return Err(UnsupportedAuth { method: "md5" }.into());
                },
                Authentication::GSS => {
                    return Err(UnsupportedAuth { method: "gss" }.into());
                },
                Authentication::SSPI => {
                    return Err(UnsupportedAuth { method: "sspi" }.into());
                },
                Authentication::SASL { .. } => {
                    return Err(UnsupportedAuth { method: "sasl" }.into());
                },
                Authentication::SASLContinue { .. } | Authentication::SASLFinal { .. } => {
                    return Err(ProtocolError::unexpected_phase(
                        Authentication::MSGTYPE,
                        "startup without a SASL exchange",
                    )
                    .into());
                },
            },
            BackendMessage::ParameterStatus(param) => {
                parameters.insert(param.name, param.value);
            },
            BackendMessage::BackendKeyData(data) => key = Some(data),
            BackendMessage::NoticeResponse(notice) => {
                tracing::warn!(target: "pgmux", "{}", notice.fields);
            },
            // the server accepted an older minor version; nothing to adjust
            BackendMessage::NegotiateProtocolVersion(_) => {},
            BackendMessage::ErrorResponse(err) => {
                return Err(err.to_db_error()?.into());
            },
            BackendMessage::ReadyForQuery(ready) => {
                return Ok(Handshake { key, parameters, status: ready.status });
            },
            other => {
                return Err(ProtocolError::unexpected_phase(other.msgtype(), "startup").into());
            },
        }
    }
}
