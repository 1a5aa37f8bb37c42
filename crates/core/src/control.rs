//! Control messages and the control path that applies them.
//!
//! Messages are queued on a channel and applied to the session one at a
//! time, in arrival order, by a dedicated thread. Non-fatal failures are
//! logged and the loop carries on; a session-fatal error stops the loop and
//! is returned through the thread's join handle.
//!
//! ## Command syntax
//!
//! | Command | Message |
//! |---------|---------|
//! | `dest <address>` | [`ControlMessage::ChangeDestination`] |
//! | `port <port>` | [`ControlMessage::ChangeSendPort`] |
//! | `pause` | [`ControlMessage::Pause`] |
//! | `play` | [`ControlMessage::Play`] |
//! | `fec <grammar>` | [`ControlMessage::ChangeFec`] |

use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::error::{ConfigErrorKind, Result, RxtxError};
use crate::session::Session;

/// A runtime reconfiguration request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Retarget the single open endpoint.
    ChangeDestination(String),
    /// Rebuild every endpoint at a new send-port base.
    ChangeSendPort(u16),
    Pause,
    Play,
    /// Replace the FEC encoder (`percents ...` or `cfg ...`).
    ChangeFec(String),
}

impl FromStr for ControlMessage {
    type Err = RxtxError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let invalid = || RxtxError::config(ConfigErrorKind::InvalidCommand(line.to_string()));
        let (command, arg) = match line.split_once(char::is_whitespace) {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match (command, arg) {
            ("pause", "") => Ok(Self::Pause),
            ("play", "") => Ok(Self::Play),
            ("dest", addr) if !addr.is_empty() => Ok(Self::ChangeDestination(addr.to_string())),
            ("port", port) => port.parse().map(Self::ChangeSendPort).map_err(|_| invalid()),
            ("fec", grammar) if !grammar.is_empty() => Ok(Self::ChangeFec(grammar.to_string())),
            _ => Err(invalid()),
        }
    }
}

/// Sending side of a session's control channel.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlMessage>,
}

impl ControlHandle {
    /// Queue a message. Fails once the control path has stopped.
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| RxtxError::ControlStopped)
    }
}

/// Start the control path for `session` on its own thread.
///
/// The thread runs until every [`ControlHandle`] is dropped or a message
/// fails with a session-fatal error.
pub fn spawn(session: Arc<Session>) -> (ControlHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || run(&session, rx));
    (ControlHandle { tx }, handle)
}

/// Apply messages from `rx` until the channel closes or a fatal error occurs.
pub fn run(session: &Session, rx: Receiver<ControlMessage>) -> Result<()> {
    for message in rx {
        tracing::debug!(?message, "control message");
        match session.dispatch(message) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "session-fatal error, stopping control path");
                return Err(e);
            }
            Err(e) => tracing::warn!(error = %e, "control message rejected"),
        }
    }
    tracing::debug!("control path exited");
    Ok(())
}
