//! Command execution drivers.
//!
//! Both execution paths queue one command on the [`Session`] and then wait
//! for its complete reply; they differ only in how they wait.
//!
//! - The blocking path lets the session block on the socket.
//! - The async path switches the socket to non-blocking mode, registers a
//!   duplicate of it with the tokio reactor, and suspends on readiness
//!   events. Other tasks on the same runtime keep running while a command
//!   is in flight.
//!
//! The async path is a small state machine ([`WaitState`]):
//!
//! ```text
//! Sending ──flush complete──► AwaitingReadable ──reply complete──► Draining ──► Done
//!    ▲   ◄──socket full: wait writable                │                │
//!    └──────── output queued mid-reply ───────────────┘                └──► Failed
//! ```
//!
//! In both paths the reply is collected the same way: the first server error
//! in the batch wins, otherwise the first result; extra results are drained
//! and discarded so the session is ready for the next command.

use fenrir_codec::{CodecError, RawResult, ResultStatus, Session};
use fenrir_types::TypeError;
use tokio::io::Interest;
use tokio::runtime::Handle;

use crate::error::{Error, Result};
use crate::state::WaitState;

/// Run one command to completion, blocking the calling thread.
pub(crate) fn execute_blocking<F>(session: &mut Session, queue: F) -> Result<RawResult>
where
    F: FnOnce(&mut Session) -> std::result::Result<(), CodecError>,
{
    if session.is_busy() {
        tracing::debug!("finishing the reply of an abandoned command");
        session
            .wait_blocking()
            .map_err(|e| transport_failure(session, e))?;
    }
    discard_stale(session);

    queue(&mut *session)?;
    session
        .wait_blocking()
        .map_err(|e| transport_failure(session, e))?;
    collect(session)
}

/// Run one command to completion, suspending on socket readiness.
///
/// The socket is back in blocking mode when this returns, whatever the
/// outcome. If the returned future is dropped mid-flight, the next command
/// on the session first finishes the abandoned reply.
pub(crate) async fn execute_async<F>(
    session: &mut Session,
    runtime: &Handle,
    queue: F,
) -> Result<RawResult>
where
    F: FnOnce(&mut Session) -> std::result::Result<(), CodecError>,
{
    session.set_nonblocking(true)?;
    let readiness = match Readiness::register(session, runtime) {
        Ok(readiness) => readiness,
        Err(e) => {
            restore_blocking(session);
            return Err(e);
        }
    };

    let outcome = {
        let mut wait = AsyncWait::new(session, &readiness);
        wait.run(queue).await
    };

    drop(readiness);
    restore_blocking(session);
    outcome
}

struct AsyncWait<'a> {
    session: &'a mut Session,
    readiness: &'a Readiness,
    state: WaitState,
}

impl<'a> AsyncWait<'a> {
    fn new(session: &'a mut Session, readiness: &'a Readiness) -> Self {
        Self {
            session,
            readiness,
            state: WaitState::default(),
        }
    }

    async fn run<F>(&mut self, queue: F) -> Result<RawResult>
    where
        F: FnOnce(&mut Session) -> std::result::Result<(), CodecError>,
    {
        if self.session.is_busy() {
            tracing::debug!("finishing the reply of an abandoned command");
            if let Err(e) = self.pump().await {
                return Err(self.fail(e));
            }
        }
        discard_stale(&mut *self.session);

        queue(&mut *self.session)?;
        self.transition(WaitState::Sending);
        if let Err(e) = self.pump().await {
            return Err(self.fail(e));
        }

        let outcome = collect(&mut *self.session);
        self.transition(if outcome.is_ok() {
            WaitState::Done
        } else {
            WaitState::Failed
        });
        outcome
    }

    // Drive Sending/AwaitingReadable until the reply is fully buffered.
    async fn pump(&mut self) -> std::result::Result<(), CodecError> {
        loop {
            match self.state {
                WaitState::Sending => {
                    if self.session.flush()? {
                        self.transition(WaitState::AwaitingReadable);
                    } else {
                        self.readiness.writable().await?;
                    }
                }
                WaitState::AwaitingReadable => {
                    self.session.consume_input()?;
                    if self.session.has_pending_output() {
                        // The server asked for input mid-reply (copy refusal).
                        self.transition(WaitState::Sending);
                    } else if self.session.is_busy() {
                        self.readiness.readable().await?;
                    } else {
                        self.transition(WaitState::Draining);
                        return Ok(());
                    }
                }
                WaitState::Draining | WaitState::Done | WaitState::Failed => return Ok(()),
            }
        }
    }

    fn transition(&mut self, next: WaitState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "wait state");
            self.state = next;
        }
    }

    fn fail(&mut self, err: CodecError) -> Error {
        self.transition(WaitState::Failed);
        transport_failure(&mut *self.session, err)
    }
}

/// Pick the caller's result out of everything the reply produced.
///
/// A server error anywhere in the batch is reported in preference to any
/// successful result; otherwise the first result is returned.
pub(crate) fn collect(session: &mut Session) -> Result<RawResult> {
    let mut chosen: Option<RawResult> = None;
    let mut discarded = 0usize;

    while let Some(result) = session.take_result() {
        match &chosen {
            None => chosen = Some(result),
            Some(first) if !first.is_error() && result.is_error() => {
                chosen = Some(result);
                discarded += 1;
            }
            Some(_) => discarded += 1,
        }
    }

    if discarded > 0 {
        tracing::warn!(discarded, "discarded extra results");
    }

    match chosen {
        Some(result) if result.is_error() => Err(match result.into_db_error() {
            Some(db) => Error::server(db),
            None => Error::Protocol("error result without error fields".into()),
        }),
        // The command ran; only its text could not be decoded.
        Some(result) if result.status() == ResultStatus::Undecodable => {
            let reason = result.decode_error().unwrap_or("field is not valid UTF-8");
            Err(TypeError::InvalidEncoding(reason.to_owned()).into())
        }
        Some(result) => Ok(result),
        None => Err(Error::Protocol("no result received".into())),
    }
}

/// Translate a transport failure, preferring a server error that arrived
/// just before it (typically a `FATAL` sent before the server hung up).
pub(crate) fn transport_failure(session: &mut Session, err: CodecError) -> Error {
    let mut server_error = None;
    while let Some(result) = session.take_result() {
        if server_error.is_none() {
            server_error = result.into_db_error();
        }
    }
    match server_error {
        Some(db) => Error::server(db),
        None => {
            tracing::debug!(error = %err, "transport failure while waiting for reply");
            err.into()
        }
    }
}

fn discard_stale(session: &mut Session) {
    let mut stale = 0usize;
    while session.take_result().is_some() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!(discarded = stale, "discarded results of an abandoned command");
    }
}

fn restore_blocking(session: &mut Session) {
    if !session.is_ok() {
        return;
    }
    if let Err(e) = session.set_nonblocking(false) {
        tracing::warn!(error = %e, "failed to restore blocking mode");
    }
}

/// Socket readiness source for the async path.
///
/// Watches a duplicate of the session socket through the runtime's reactor.
/// All reads and writes still go through the session; after each wakeup the
/// readiness is cleared so the next wait sleeps until new events arrive.
struct Readiness {
    stream: tokio::net::TcpStream,
}

impl Readiness {
    fn register(session: &Session, runtime: &Handle) -> Result<Self> {
        // The duplicate shares the non-blocking flag set on the session.
        let stream = session.try_clone_stream()?;
        let stream = {
            // Registration needs the runtime context; the guard must not
            // outlive this block.
            let _guard = runtime.enter();
            tokio::net::TcpStream::from_std(stream)?
        };
        Ok(Self { stream })
    }

    async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await?;
        self.clear(Interest::READABLE);
        Ok(())
    }

    async fn writable(&self) -> std::io::Result<()> {
        self.stream.writable().await?;
        self.clear(Interest::WRITABLE);
        Ok(())
    }

    fn clear(&self, interest: Interest) {
        // A `WouldBlock` from `try_io` resets the cached readiness.
        let _ = self
            .stream
            .try_io(interest, || Err::<(), _>(std::io::ErrorKind::WouldBlock.into()));
    }
}
