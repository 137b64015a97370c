//! Startup and authentication.

use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::Message;
use postgres_protocol::message::frontend;

use crate::error::CodecError;
use crate::reply::DbError;
use crate::session::{BackendKey, Session, log_notice};

/// Run the startup exchange until the server reports `ReadyForQuery`.
///
/// The whole exchange is bounded by the session's connect timeout.
pub(crate) fn handshake(session: &mut Session) -> Result<(), CodecError> {
    let timeout = Some(session.params.connect_timeout).filter(|t| !t.is_zero());
    session.set_io_timeout(timeout)?;

    send_startup(session)?;

    let mut scram: Option<sasl::ScramSha256> = None;
    loop {
        match session.read_message_blocking()? {
            Message::AuthenticationOk => {
                tracing::trace!("authentication accepted");
            }
            Message::AuthenticationCleartextPassword => {
                tracing::debug!("server requested cleartext password");
                let password = required_password(session)?;
                frontend::password_message(password.as_bytes(), &mut session.write_buf)?;
                session.flush()?;
            }
            Message::AuthenticationMd5Password(body) => {
                tracing::debug!("server requested md5 password");
                let password = required_password(session)?;
                let hash = authentication::md5_hash(
                    session.params.user.as_bytes(),
                    password.as_bytes(),
                    body.salt(),
                );
                frontend::password_message(hash.as_bytes(), &mut session.write_buf)?;
                session.flush()?;
            }
            Message::AuthenticationSasl(body) => {
                let mut mechanisms = body.mechanisms();
                let mut supported = false;
                while let Some(mechanism) = mechanisms
                    .next()
                    .map_err(|e| CodecError::Protocol(e.to_string()))?
                {
                    supported |= mechanism == sasl::SCRAM_SHA_256;
                }
                if !supported {
                    return Err(CodecError::Authentication(
                        "server offered no supported SASL mechanism".into(),
                    ));
                }

                tracing::debug!("server requested SCRAM-SHA-256");
                let password = required_password(session)?;
                let state = sasl::ScramSha256::new(
                    password.as_bytes(),
                    sasl::ChannelBinding::unsupported(),
                );
                frontend::sasl_initial_response(
                    sasl::SCRAM_SHA_256,
                    state.message(),
                    &mut session.write_buf,
                )?;
                session.flush()?;
                scram = Some(state);
            }
            Message::AuthenticationSaslContinue(body) => {
                let state = scram
                    .as_mut()
                    .ok_or(CodecError::UnexpectedMessage("SASL continue before SASL start"))?;
                state
                    .update(body.data())
                    .map_err(|e| CodecError::Authentication(e.to_string()))?;
                frontend::sasl_response(state.message(), &mut session.write_buf)?;
                session.flush()?;
            }
            Message::AuthenticationSaslFinal(body) => {
                let state = scram
                    .as_mut()
                    .ok_or(CodecError::UnexpectedMessage("SASL final before SASL start"))?;
                state
                    .finish(body.data())
                    .map_err(|e| CodecError::Authentication(e.to_string()))?;
            }
            Message::AuthenticationKerberosV5
            | Message::AuthenticationScmCredential
            | Message::AuthenticationGss
            | Message::AuthenticationSspi
            | Message::AuthenticationGssContinue(_) => {
                return Err(CodecError::Authentication(
                    "unsupported authentication method requested by server".into(),
                ));
            }
            Message::BackendKeyData(body) => {
                session.backend_key = Some(BackendKey {
                    process_id: body.process_id(),
                    secret_key: body.secret_key(),
                });
            }
            Message::ParameterStatus(body) => session.record_parameter(&body)?,
            Message::NoticeResponse(body) => log_notice(&mut body.fields()),
            Message::ErrorResponse(body) => {
                let err = DbError::parse(&mut body.fields())
                    .map_err(|e| CodecError::Protocol(e.to_string()))?;
                return Err(CodecError::Server(err));
            }
            Message::ReadyForQuery(body) => {
                session.set_transaction_status(body.status());
                break;
            }
            _ => return Err(CodecError::UnexpectedMessage("unexpected message during startup")),
        }
    }

    session.set_io_timeout(None)?;
    Ok(())
}

fn send_startup(session: &mut Session) -> Result<(), CodecError> {
    let params = &session.params;
    let mut startup: Vec<(&str, &str)> = vec![("user", params.user.as_str())];
    if let Some(database) = &params.database {
        startup.push(("database", database));
    }
    if let Some(application_name) = &params.application_name {
        startup.push(("application_name", application_name));
    }
    if let Some(client_encoding) = &params.client_encoding {
        startup.push(("client_encoding", client_encoding));
    }
    if let Some(options) = &params.options {
        startup.push(("options", options));
    }

    frontend::startup_message(startup, &mut session.write_buf)?;
    session.flush()?;
    tracing::trace!(user = %session.params.user, "startup message sent");
    Ok(())
}

fn required_password(session: &Session) -> Result<String, CodecError> {
    session
        .params
        .password
        .clone()
        .ok_or_else(|| CodecError::Authentication("password required but none was supplied".into()))
}
