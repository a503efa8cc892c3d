//! Unread accounting.
//!
//! Counts are always derived from the message log; nothing here keeps its
//! own state. "general" covers DMs that do not involve support; "support"
//! covers the support channel as seen by the caller: replies addressed to
//! an ordinary user, or the whole support inbox for an admin.

use serde::Serialize;

use crate::db::{Db, MarkRead};
use crate::error::ChatError;
use crate::identity::{Identity, Principal};
use crate::server::SharedState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounts {
    pub general: i64,
    pub support: i64,
}

impl UnreadCounts {
    pub fn total(&self) -> i64 {
        self.general + self.support
    }
}

pub fn unread_counts(db: &Db, principal: &Principal) -> rusqlite::Result<UnreadCounts> {
    let general = db.count_unread_direct(&principal.user_id)?;
    let support = if principal.is_admin() {
        db.count_unread_support_inbox()?
    } else {
        db.count_unread_support_replies(&principal.user_id)?
    };
    Ok(UnreadCounts { general, support })
}

/// Translate a client mark-read request into a store predicate.
pub fn read_scope(
    principal: &Principal,
    is_support: bool,
    thread_user_id: Option<&str>,
) -> Result<MarkRead, ChatError> {
    let thread_user_id = thread_user_id.filter(|id| !id.is_empty());
    if is_support {
        if !principal.is_admin() {
            return Ok(MarkRead::SupportTo { user: principal.user_id.clone() });
        }
        return match thread_user_id.map(Identity::parse) {
            Some(Identity::User(user)) => Ok(MarkRead::SupportFrom { user }),
            Some(Identity::Support) => Err(ChatError::validation("threadUserId must be an ordinary user")),
            None => Err(ChatError::validation("threadUserId is required to mark a support thread read")),
        };
    }
    match thread_user_id.map(Identity::parse) {
        Some(Identity::Support) => Err(ChatError::validation("support messages are marked read with isSupport")),
        Some(Identity::User(from)) => Ok(MarkRead::DirectTo { user: principal.user_id.clone(), from: Some(from) }),
        None => Ok(MarkRead::DirectTo { user: principal.user_id.clone(), from: None }),
    }
}

/// Mark matching messages read and return the caller's fresh counts.
pub fn mark_read(
    state: &SharedState,
    principal: &Principal,
    is_support: bool,
    thread_user_id: Option<&str>,
) -> Result<UnreadCounts, ChatError> {
    let scope = read_scope(principal, is_support, thread_user_id)?;
    state.with_db(|db| {
        let changed = db.mark_read(&scope)?;
        tracing::debug!(user_id = %principal.user_id, ?scope, changed, "marked read");
        unread_counts(db, principal)
    })
}
