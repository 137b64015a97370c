//! # fenrir-client
//!
//! PostgreSQL connection with blocking and event-driven async execution.
//!
//! This is the primary public API surface for the fenrir project. A
//! [`Connection`] owns one server session; every command returns a
//! [`ResultCursor`] holding the complete reply.
//!
//! ## Features
//!
//! - **Two execution paths**: `execute*` blocks the calling thread,
//!   `async_execute*` suspends on socket readiness through tokio
//! - **Parameterized commands**: values travel separately from the command
//!   text, with `None` sent as NULL
//! - **Prepared statements**: named, tracked in an LRU cache
//! - **Typed errors**: transport failures and server rejections are
//!   distinct, and server errors carry their SQLSTATE
//!
//! ## Connection States
//!
//! ```text
//! connect() -> Ok ──transport failure / FATAL──► Bad
//!              ▲                                  │
//!              └──────────── reset() ─────────────┘
//! close() -> Bad (idempotent)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use fenrir_client::{Config, Connection};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_connection_string("host=localhost user=app dbname=app")?
//!         .runtime(tokio::runtime::Handle::current());
//!     let mut conn = Connection::connect_with(config)?;
//!
//!     let cursor = conn
//!         .async_execute_params("SELECT name FROM users WHERE id = $1", &[&1i32])
//!         .await?;
//!
//!     for row in cursor.rows() {
//!         let name: String = row.get(0)?;
//!         println!("User: {name}");
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod state;
pub mod statement_cache;
mod wait;

pub use config::Config;
pub use connection::Connection;
pub use cursor::{Column, ResultCursor, Row};
pub use error::{Error, Result};
pub use fenrir_codec::ResultStatus;
pub use fenrir_types::{FromSql, SqlValue, ToSql, TypeError};
pub use state::{ConnectionStatus, TransactionState, WaitState};
pub use statement_cache::{PreparedStatement, StatementCache};
