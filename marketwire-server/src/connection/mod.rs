//! Per-client connection lifecycle.
//!
//! Each socket gets a [`Connection`] that moves through
//! `Unauthenticated -> Authenticated -> Closed`:
//! - the first frame must be `auth`; anything else is a protocol violation
//! - a good token registers the connection and replies `authenticated`
//! - once authenticated, frames go to the router and read-state tracker
//! - frames arriving after close are ignored
//!
//! The transport loop (timeouts, heartbeat, outbound queue) is in [`socket`].

mod socket;

pub use socket::serve;

use crate::error::{AuthError, ChatError};
use crate::identity::Principal;
use crate::protocol::{ClientFrame, ServerFrame};
use crate::read_state;
use crate::registry::{ConnId, Outbox, Registration};
use crate::routing::{self, SendRequest};
use crate::server::SharedState;

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AuthTimeout,
    TokenExpired,
    TokenInvalid,
    ProtocolViolation,
    SlowConsumer,
    /// The user directory could not be read during auth.
    Unavailable,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::AuthTimeout => 4000,
            CloseReason::TokenExpired => 4001,
            CloseReason::TokenInvalid => 4002,
            CloseReason::ProtocolViolation => 4003,
            CloseReason::SlowConsumer => 4008,
            CloseReason::Unavailable => 1011,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::AuthTimeout => "authentication timeout",
            CloseReason::TokenExpired => "token expired",
            CloseReason::TokenInvalid => "token invalid",
            CloseReason::ProtocolViolation => "expected auth frame",
            CloseReason::SlowConsumer => "outbound queue overflow",
            CloseReason::Unavailable => "authentication unavailable",
        }
    }

    fn from_auth(err: &AuthError) -> Self {
        match err {
            AuthError::Expired => CloseReason::TokenExpired,
            AuthError::Unavailable(_) => CloseReason::Unavailable,
            AuthError::Missing | AuthError::Malformed | AuthError::BadSignature | AuthError::UnknownUser(_) => {
                CloseReason::TokenInvalid
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close(CloseReason),
}

pub enum Phase {
    Unauthenticated,
    Authenticated { principal: Principal, registration: Registration },
    Closed,
}

/// State of a single client connection.
pub struct Connection {
    pub conn_id: ConnId,
    outbox: Outbox,
    phase: Phase,
}

impl Connection {
    pub fn new(conn_id: ConnId, outbox: Outbox) -> Self {
        Self { conn_id, outbox, phase: Phase::Unauthenticated }
    }

    pub fn principal(&self) -> Option<&Principal> {
        match &self.phase {
            Phase::Authenticated { principal, .. } => Some(principal),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.phase, Phase::Authenticated { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Handle one inbound text frame.
    pub fn on_frame(&mut self, state: &SharedState, text: &str) -> FrameAction {
        match &self.phase {
            Phase::Closed => {
                tracing::debug!(conn_id = self.conn_id, "frame after close ignored");
                FrameAction::Continue
            }
            Phase::Unauthenticated => self.authenticate(state, text),
            Phase::Authenticated { principal, .. } => {
                let principal = principal.clone();
                self.dispatch(state, &principal, text);
                FrameAction::Continue
            }
        }
    }

    /// Transition to `Closed` and leave the registry. Safe to call twice.
    pub fn on_close(&mut self, state: &SharedState) {
        if let Phase::Authenticated { principal, registration } = std::mem::replace(&mut self.phase, Phase::Closed) {
            state.registry.deregister(&registration);
            tracing::info!(conn_id = self.conn_id, user_id = %principal.user_id, "connection closed");
        }
    }

    fn authenticate(&mut self, state: &SharedState, text: &str) -> FrameAction {
        let token = match ClientFrame::parse(text) {
            Ok(ClientFrame::Auth { token }) => token,
            Ok(_) | Err(_) => {
                tracing::warn!(conn_id = self.conn_id, "first frame was not an auth frame");
                self.phase = Phase::Closed;
                return FrameAction::Close(CloseReason::ProtocolViolation);
            }
        };

        // Register under the db lock so no message persisted after this
        // point can miss the new connection.
        let db = state.db.lock();
        let principal = match state.tokens.resolve(&token, &db) {
            Ok(principal) => principal,
            Err(e) => {
                match &e {
                    AuthError::Unavailable(detail) => {
                        tracing::error!(conn_id = self.conn_id, error = %detail, "auth lookup failed")
                    }
                    other => tracing::warn!(conn_id = self.conn_id, error = %other, "auth rejected"),
                }
                self.phase = Phase::Closed;
                return FrameAction::Close(CloseReason::from_auth(&e));
            }
        };
        self.outbox.offer(ServerFrame::Authenticated);
        let registration = state.registry.register(&principal.user_id, self.conn_id, self.outbox.clone());
        drop(db);

        tracing::info!(
            conn_id = self.conn_id,
            user_id = %principal.user_id,
            role = principal.role.as_str(),
            "connection authenticated"
        );
        self.phase = Phase::Authenticated { principal, registration };
        FrameAction::Continue
    }

    fn dispatch(&self, state: &SharedState, principal: &Principal, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(conn_id = self.conn_id, error = %e, "malformed frame");
                self.reply(ServerFrame::error(format!("malformed frame: {e}")));
                return;
            }
        };

        let result = match frame {
            ClientFrame::Auth { .. } => Err(ChatError::validation("already authenticated")),
            ClientFrame::Message { receiver_id, content, is_support, client_msg_id } => {
                let req = SendRequest { receiver_id, content, is_support, client_msg_id };
                routing::send(state, principal, req, Some(self.conn_id)).map(|_| ())
            }
            ClientFrame::Resume { after_id } => self.resume(state, principal, after_id),
            ClientFrame::Read { is_support, thread_user_id } => {
                read_state::mark_read(state, principal, is_support, thread_user_id.as_deref())
                    .map(|counts| self.reply(ServerFrame::Unread { general: counts.general, support: counts.support }))
            }
        };

        if let Err(e) = result {
            tracing::debug!(conn_id = self.conn_id, user_id = %principal.user_id, error = %e, "frame rejected");
            self.reply(ServerFrame::error(e.client_message()));
        }
    }

    /// Replay messages after `after_id`, in batches that fit the outbound queue.
    fn resume(&self, state: &SharedState, principal: &Principal, after_id: i64) -> Result<(), ChatError> {
        // Replay under the db lock so live pushes cannot interleave out of order.
        state.with_db(|db| {
            // Whatever is already queued stays; one slot is kept for `resumed`.
            let batch = self.outbox.tx.capacity().saturating_sub(1);
            if batch == 0 {
                self.reply(ServerFrame::Resumed { cursor: after_id, more: true });
                tracing::debug!(conn_id = self.conn_id, after_id, "resume deferred, outbound queue full");
                return Ok(());
            }
            let mut messages = db.messages_after(&principal.user_id, principal.is_admin(), after_id, batch + 1)?;
            let more = messages.len() > batch;
            messages.truncate(batch);
            let cursor = messages.last().map_or(after_id, |m| m.id);
            let replayed = messages.len();
            for message in messages {
                self.reply(ServerFrame::NewMessage { message });
            }
            self.reply(ServerFrame::Resumed { cursor, more });
            tracing::debug!(conn_id = self.conn_id, after_id, replayed, more, "resume replayed");
            Ok(())
        })
    }

    fn reply(&self, frame: ServerFrame) {
        if !self.outbox.offer(frame) {
            tracing::debug!(conn_id = self.conn_id, "reply dropped");
        }
    }
}
