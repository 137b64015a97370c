//! Server-side decoding of frontend (client-to-server) messages.
//!
//! `postgres-protocol` only parses backend messages, so the mock server
//! carries its own decoder for the handful of frontend messages a client
//! sends. Startup packets have no tag byte; everything after them does.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Protocol version 3.0 as sent in the startup packet.
pub const PROTOCOL_VERSION_3: i32 = 196_608;
/// Magic code of an `SSLRequest` packet.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
/// Magic code of a `CancelRequest` packet.
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A decoded frontend message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    /// Request to negotiate TLS.
    SslRequest,
    /// Out-of-band cancellation request.
    CancelRequest {
        /// Target backend process.
        process_id: i32,
        /// Secret key from `BackendKeyData`.
        secret_key: i32,
    },
    /// Startup packet with its parameters in send order.
    Startup {
        /// `(name, value)` pairs such as `user` and `database`.
        parameters: Vec<(String, String)>,
    },
    /// Password, MD5 digest, or SASL payload (`p`).
    Password(Bytes),
    /// Simple query (`Q`).
    Query(String),
    /// Parse (`P`).
    Parse {
        /// Statement name; empty for the unnamed statement.
        name: String,
        /// Statement text.
        query: String,
    },
    /// Bind (`B`).
    Bind {
        /// Portal name.
        portal: String,
        /// Source statement name.
        statement: String,
        /// Parameter values as text; `None` is NULL.
        values: Vec<Option<String>>,
    },
    /// Describe (`D`) of a statement (`S`) or portal (`P`).
    Describe {
        /// `b'S'` or `b'P'`.
        kind: u8,
        /// Object name.
        name: String,
    },
    /// Execute (`E`).
    Execute {
        /// Portal name.
        portal: String,
        /// Row limit; zero means no limit.
        max_rows: i32,
    },
    /// Close (`C`) of a statement or portal.
    Close {
        /// `b'S'` or `b'P'`.
        kind: u8,
        /// Object name.
        name: String,
    },
    /// Sync (`S`).
    Sync,
    /// Flush (`H`).
    Flush,
    /// Copy data (`d`).
    CopyData(Bytes),
    /// Copy done (`c`).
    CopyDone,
    /// Copy fail (`f`) with the client's reason.
    CopyFail(String),
    /// Terminate (`X`).
    Terminate,
}

/// Decoder for frontend messages.
///
/// Starts in the untagged startup phase and switches to tagged messages once
/// a protocol 3.0 startup packet has been seen.
#[derive(Debug, Default)]
pub struct FrontendCodec {
    started: bool,
}

impl FrontendCodec {
    /// Create a codec expecting a startup packet first.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_startup(&mut self, src: &mut BytesMut) -> io::Result<Option<FrontendMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(8..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(invalid(format!("invalid startup packet length {len}")));
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(len).freeze();
        body.advance(4);
        let code = read_i32(&mut body)?;
        match code {
            SSL_REQUEST_CODE => Ok(Some(FrontendMessage::SslRequest)),
            CANCEL_REQUEST_CODE => Ok(Some(FrontendMessage::CancelRequest {
                process_id: read_i32(&mut body)?,
                secret_key: read_i32(&mut body)?,
            })),
            PROTOCOL_VERSION_3 => {
                let mut parameters = Vec::new();
                loop {
                    let name = read_cstr(&mut body)?;
                    if name.is_empty() {
                        break;
                    }
                    let value = read_cstr(&mut body)?;
                    parameters.push((name, value));
                }
                self.started = true;
                Ok(Some(FrontendMessage::Startup { parameters }))
            }
            other => Err(invalid(format!("unsupported protocol code {other}"))),
        }
    }
}

impl Decoder for FrontendCodec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if !self.started {
            return self.decode_startup(src);
        }

        if src.len() < 5 {
            return Ok(None);
        }
        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
            return Err(invalid(format!("invalid length {len} for message '{}'", tag as char)));
        }
        let total = len + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut body = src.split_to(total).freeze();
        body.advance(5);

        let message = match tag {
            b'p' => FrontendMessage::Password(body),
            b'Q' => FrontendMessage::Query(read_cstr(&mut body)?),
            b'P' => {
                let name = read_cstr(&mut body)?;
                let query = read_cstr(&mut body)?;
                // Parameter type OIDs are ignored; every value arrives as text.
                FrontendMessage::Parse { name, query }
            }
            b'B' => decode_bind(&mut body)?,
            b'D' => FrontendMessage::Describe {
                kind: read_u8(&mut body)?,
                name: read_cstr(&mut body)?,
            },
            b'E' => FrontendMessage::Execute {
                portal: read_cstr(&mut body)?,
                max_rows: read_i32(&mut body)?,
            },
            b'C' => FrontendMessage::Close {
                kind: read_u8(&mut body)?,
                name: read_cstr(&mut body)?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'd' => FrontendMessage::CopyData(body),
            b'c' => FrontendMessage::CopyDone,
            b'f' => FrontendMessage::CopyFail(read_cstr(&mut body)?),
            b'X' => FrontendMessage::Terminate,
            other => return Err(invalid(format!("unknown frontend message '{}'", other as char))),
        };
        Ok(Some(message))
    }
}

fn decode_bind(body: &mut Bytes) -> io::Result<FrontendMessage> {
    let portal = read_cstr(body)?;
    let statement = read_cstr(body)?;

    let format_count = read_i16(body)?;
    for _ in 0..format_count {
        if read_i16(body)? != 0 {
            return Err(invalid("binary parameters are not supported by the mock".into()));
        }
    }

    let value_count = read_i16(body)?;
    let mut values = Vec::with_capacity(usize::try_from(value_count).unwrap_or(0));
    for _ in 0..value_count {
        let len = read_i32(body)?;
        if len < 0 {
            values.push(None);
            continue;
        }
        let len = len as usize;
        if body.remaining() < len {
            return Err(invalid("truncated bind value".into()));
        }
        let raw = body.split_to(len);
        let text = String::from_utf8(raw.to_vec()).map_err(|e| invalid(e.to_string()))?;
        values.push(Some(text));
    }
    // Result format codes follow; results are always sent as text.

    Ok(FrontendMessage::Bind {
        portal,
        statement,
        values,
    })
}

fn read_u8(buf: &mut Bytes) -> io::Result<u8> {
    if buf.remaining() < 1 {
        return Err(invalid("truncated message".into()));
    }
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut Bytes) -> io::Result<i16> {
    if buf.remaining() < 2 {
        return Err(invalid("truncated message".into()));
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut Bytes) -> io::Result<i32> {
    if buf.remaining() < 4 {
        return Err(invalid("truncated message".into()));
    }
    Ok(buf.get_i32())
}

fn read_cstr(buf: &mut Bytes) -> io::Result<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| invalid("unterminated string".into()))?;
    let raw = buf.split_to(end);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|e| invalid(e.to_string()))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
