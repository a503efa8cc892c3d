//! Notification fanout.
//!
//! Domain events (support tickets, task assignments, payments, hires) become
//! durable notification rows and are then pushed to whichever targets are
//! online. A broadcast (no target) is materialized as one row per admin so
//! each admin keeps independent read state.
//!
//! Fanout does no deduplication; callers emit each logical event once.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::{DbTx, Notification};
use crate::error::{ChatError, UnknownVariant};
use crate::protocol::ServerFrame;
use crate::server::SharedState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SupportTicket,
    TaskAssigned,
    PaymentReceived,
    Hired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::SupportTicket => "support_ticket",
            NotificationKind::TaskAssigned => "task_assigned",
            NotificationKind::PaymentReceived => "payment_received",
            NotificationKind::Hired => "hired",
        }
    }
}

impl FromStr for NotificationKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "support_ticket" => Ok(NotificationKind::SupportTicket),
            "task_assigned" => Ok(NotificationKind::TaskAssigned),
            "payment_received" => Ok(NotificationKind::PaymentReceived),
            "hired" => Ok(NotificationKind::Hired),
            other => Err(UnknownVariant { kind: "notification type", value: other.to_string() }),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event to fan out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub content: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// `None` broadcasts to every admin.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Write one row per target inside an open transaction.
///
/// Returns the rows so the caller can push them after commit.
pub fn insert_fanout(tx: &DbTx<'_>, event: &NewNotification) -> Result<Vec<Notification>, ChatError> {
    let targets = match &event.user_id {
        Some(user) => {
            if tx.get_user(user)?.is_none() {
                return Err(ChatError::routing(format!("unknown notification target: {user}")));
            }
            vec![user.clone()]
        }
        None => tx.admin_ids()?,
    };
    if targets.is_empty() {
        tracing::warn!(kind = %event.kind, "broadcast notification has no admin recipients");
    }
    let mut rows = Vec::with_capacity(targets.len());
    for target in &targets {
        rows.push(tx.insert_notification(event.kind, &event.content, target, &event.data)?);
    }
    Ok(rows)
}

/// Push already-committed notifications to their online targets.
pub fn push_all(state: &SharedState, rows: &[Notification]) {
    for row in rows {
        let Some(ref user) = row.user_id else { continue };
        let delivered = state
            .registry
            .push(user, &ServerFrame::Notification { notification: row.clone() });
        tracing::debug!(notification_id = row.id, user_id = %user, delivered, "notification pushed");
    }
}

/// Record a domain event and push it live.
pub fn notify(state: &SharedState, event: NewNotification) -> Result<Vec<Notification>, ChatError> {
    if event.content.trim().is_empty() {
        return Err(ChatError::validation("notification content is empty"));
    }
    let db = state.db.lock();
    let tx = db.begin()?;
    let rows = insert_fanout(&tx, &event)?;
    tx.commit()?;
    tracing::info!(kind = %event.kind, recipients = rows.len(), "notification recorded");
    push_all(state, &rows);
    Ok(rows)
}

/// Payload for the ticket raised by the first message of a support thread.
pub fn support_ticket(user_id: &str, message_id: i64, preview: &str) -> NewNotification {
    let preview: String = preview.chars().take(120).collect();
    NewNotification {
        kind: NotificationKind::SupportTicket,
        content: format!("New support ticket from {user_id}: {preview}"),
        data: serde_json::json!({ "userId": user_id, "messageId": message_id }),
        user_id: None,
    }
}
