//! # fenrir-codec
//!
//! Session layer for the PostgreSQL frontend/backend protocol.
//!
//! Message encoding and decoding are delegated to the `postgres-protocol`
//! crate. This crate owns what sits directly on top of it: the socket,
//! startup and authentication, and the assembly of backend messages into
//! complete command results.
//!
//! ## Architecture
//!
//! ```text
//! TcpStream → BackendCodec (message framing) → ReplyAssembler → RawResult
//! ```
//!
//! A [`Session`] can be driven in blocking mode ([`Session::wait_blocking`])
//! or in non-blocking mode, where the caller alternates between
//! [`Session::consume_input`] and waiting for socket readiness until
//! [`Session::is_busy`] reports the reply is complete.
//!
//! ```rust,ignore
//! use fenrir_codec::{Session, SessionParams};
//!
//! let mut session = Session::connect(params)?;
//! session.queue_query("SELECT 1")?;
//! session.wait_blocking()?;
//! let result = session.take_result();
//! ```
//!
//! ## Authentication
//!
//! Trust, cleartext password, MD5, and SCRAM-SHA-256 (without channel
//! binding) are supported.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod reply;
pub mod session;
mod startup;

pub use codec::BackendCodec;
pub use error::CodecError;
pub use reply::{ColumnDesc, CommandKind, DbError, Field, RawResult, ReplyAssembler, ResultStatus};
pub use session::{BackendKey, Session, SessionParams, SessionStatus, TransactionStatus};
