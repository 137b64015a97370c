//! # fenrir-testing
//!
//! Test infrastructure for the fenrir PostgreSQL client.
//!
//! The centerpiece is [`MockServer`], an in-process server that speaks
//! enough of the PostgreSQL wire protocol (version 3.0) for the client and
//! pool crates to be tested without a real database:
//!
//! - startup with trust, cleartext, or MD5 authentication
//! - simple and extended query protocol, including named statements
//! - canned responses per SQL text, with delays, errors, and disconnects
//! - fault injection: refusing logins, killing live sessions
//!
//! The server runs on its own thread with its own runtime, so it serves
//! blocking and async tests alike.
//!
//! ```rust,ignore
//! use fenrir_testing::{MockResponse, MockServer};
//!
//! let server = MockServer::builder()
//!     .with_response("SELECT 42", MockResponse::scalar_int(42))
//!     .start()?;
//! let conninfo = server.connection_string();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod frontend;
pub mod mock_server;

pub use frontend::{FrontendCodec, FrontendMessage};
pub use mock_server::{
    AuthMode, MockColumn, MockResponse, MockServer, MockServerBuilder, MockServerError,
};

/// Initialize a `tracing` subscriber for test output, once per process.
///
/// Honors `RUST_LOG`; silent unless the test is run with `--nocapture`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}
