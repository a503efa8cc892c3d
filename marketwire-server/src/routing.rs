//! # Message routing
//!
//! ## Aliasing rule
//!
//! | isSupport | sender role | stored sender     | stored receiver        |
//! |-----------|-------------|-------------------|------------------------|
//! | true      | not admin   | the user          | `Support`              |
//! | true      | admin       | `Support`         | explicit `receiver_id` |
//! | false     | any         | the user          | explicit `receiver_id` |
//!
//! A non-support message naming `Support` as receiver is an impersonation
//! attempt and is refused. A non-admin's `receiver_id` is ignored when
//! `isSupport` is set.
//!
//! ## Atomicity and ordering
//!
//! The message insert, the support-ticket notifications it may open, and
//! the live pushes all happen under the database lock. The insert and the
//! notifications share one transaction, so either both exist or neither
//! does. Pushing before the lock is released means live connections see
//! messages in exactly the order they were persisted.

use crate::db::{Db, Message, NewMessage, Notification, Thread};
use crate::error::ChatError;
use crate::identity::{Identity, Principal, Role};
use crate::notify;
use crate::protocol::ServerFrame;
use crate::registry::ConnId;
use crate::server::SharedState;

/// Longest accepted client retry key.
pub const MAX_RETRY_KEY_LEN: usize = 128;

/// A send command, from the socket or the HTTP fallback.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub receiver_id: Option<String>,
    pub content: String,
    pub is_support: bool,
    pub client_msg_id: Option<String>,
}

/// Stored endpoints after aliasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub sender: Identity,
    pub receiver: Identity,
}

impl Route {
    /// The non-support participant, when support is one end.
    pub fn thread_user_id(&self) -> Option<&str> {
        match (&self.sender, &self.receiver) {
            (Identity::Support, Identity::User(user)) | (Identity::User(user), Identity::Support) => Some(user),
            _ => None,
        }
    }

    pub fn involves_support(&self) -> bool {
        self.sender.is_support() || self.receiver.is_support()
    }
}

pub fn resolve_route(principal: &Principal, receiver_id: Option<&str>, is_support: bool) -> Result<Route, ChatError> {
    let receiver = receiver_id
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(Identity::parse);

    match (is_support, principal.is_admin()) {
        (true, false) => Ok(Route { sender: principal.identity(), receiver: Identity::Support }),
        (true, true) => match receiver {
            Some(Identity::User(user)) if user == principal.user_id => {
                Err(ChatError::routing("cannot reply to yourself as support"))
            }
            Some(Identity::User(user)) => Ok(Route { sender: Identity::Support, receiver: Identity::User(user) }),
            Some(Identity::Support) => Err(ChatError::routing("support cannot message itself")),
            None => Err(ChatError::validation("receiver_id is required for a support reply")),
        },
        (false, _) => match receiver {
            Some(Identity::Support) => {
                Err(ChatError::routing("support cannot be addressed directly, set isSupport instead"))
            }
            Some(Identity::User(user)) if user == principal.user_id => {
                Err(ChatError::routing("cannot message yourself"))
            }
            Some(Identity::User(user)) => Ok(Route { sender: principal.identity(), receiver: Identity::User(user) }),
            None => Err(ChatError::validation("receiver_id is required")),
        },
    }
}

pub fn validate_content(content: &str, max_len: usize) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::validation("message content is empty"));
    }
    if content.chars().count() > max_len {
        return Err(ChatError::validation(format!("message exceeds {max_len} characters")));
    }
    Ok(())
}

/// Which stored thread a history request refers to.
pub fn thread_for(principal: &Principal, is_support: bool, thread_user_id: Option<&str>) -> Result<Thread, ChatError> {
    let peer = thread_user_id.filter(|id| !id.is_empty()).map(Identity::parse);
    if is_support && !principal.is_admin() {
        return Ok(Thread::Support(principal.user_id.clone()));
    }
    match (is_support, peer) {
        (_, Some(Identity::Support)) => Err(ChatError::validation("threadUserId must be an ordinary user")),
        (true, Some(Identity::User(user))) => Ok(Thread::Support(user)),
        (false, Some(Identity::User(user))) => Ok(Thread::Direct(principal.user_id.clone(), user)),
        (_, None) => Err(ChatError::validation("threadUserId is required")),
    }
}

enum Persisted {
    New { message: Message, tickets: Vec<Notification>, admins: Vec<String> },
    /// Same retry key seen before; nothing was written.
    Replayed(Message),
}

/// Route one message: alias, persist, open a ticket if needed, deliver.
///
/// `origin` is the socket connection that issued the send. It gets a
/// `sent` ack instead of the sender echo. The HTTP fallback passes `None`.
pub fn send(
    state: &SharedState,
    principal: &Principal,
    req: SendRequest,
    origin: Option<ConnId>,
) -> Result<Message, ChatError> {
    validate_content(&req.content, state.config.max_message_len)?;
    let route = resolve_route(principal, req.receiver_id.as_deref(), req.is_support)?;
    let client_msg_id = req.client_msg_id.filter(|key| !key.is_empty());
    if client_msg_id.as_ref().is_some_and(|key| key.len() > MAX_RETRY_KEY_LEN) {
        return Err(ChatError::validation("client_msg_id is too long"));
    }

    let db = state.db.lock();
    let persisted = persist(&db, principal, &route, req.content, client_msg_id).inspect_err(|e| {
        if let ChatError::Persistence(err) = e {
            tracing::error!(user_id = %principal.user_id, error = %err, "failed to persist message");
        }
    })?;

    match persisted {
        Persisted::Replayed(message) => {
            tracing::debug!(message_id = message.id, user_id = %principal.user_id, "retry key matched, not re-sent");
            ack(state, &message, origin);
            Ok(message)
        }
        Persisted::New { message, tickets, admins } => {
            tracing::info!(
                message_id = message.id,
                sender = %message.sender_id,
                receiver = %message.receiver_id,
                author = %principal.user_id,
                tickets = tickets.len(),
                "message routed"
            );
            deliver(state, &message, &admins, origin);
            ack(state, &message, origin);
            notify::push_all(state, &tickets);
            Ok(message)
        }
    }
}

fn persist(
    db: &Db,
    principal: &Principal,
    route: &Route,
    content: String,
    client_msg_id: Option<String>,
) -> Result<Persisted, ChatError> {
    let tx = db.begin()?;

    if let Some(ref key) = client_msg_id
        && let Some(existing) = tx.message_by_retry_key(&principal.user_id, key)?
    {
        if existing.sender_id != route.sender || existing.receiver_id != route.receiver || existing.content != content {
            return Err(ChatError::validation("client_msg_id was already used for a different message"));
        }
        return Ok(Persisted::Replayed(existing));
    }

    if let Identity::User(ref receiver) = route.receiver {
        match tx.get_user(receiver)? {
            None => return Err(ChatError::routing(format!("unknown receiver: {receiver}"))),
            Some(user) if route.sender.is_support() && user.role == Role::Admin => {
                return Err(ChatError::routing("support replies go to ordinary users"));
            }
            Some(_) => {}
        }
    }

    let thread_user_id = route.thread_user_id().map(str::to_string);
    let opens_ticket = match (&route.sender, &thread_user_id) {
        (Identity::User(_), Some(user)) => !tx.support_thread_exists(user)?,
        _ => false,
    };

    let message = tx.insert_message(&NewMessage {
        sender: route.sender.clone(),
        receiver: route.receiver.clone(),
        thread_user_id,
        author_id: principal.user_id.clone(),
        content,
        client_msg_id,
    })?;

    let tickets = if opens_ticket {
        let event = notify::support_ticket(&principal.user_id, message.id, &message.content);
        notify::insert_fanout(&tx, &event)?
    } else {
        Vec::new()
    };
    let admins = if route.involves_support() { tx.admin_ids()? } else { Vec::new() };

    tx.commit().map_err(|e| {
        tracing::error!(
            alert = true,
            message_id = message.id,
            tickets = tickets.len(),
            error = %e,
            "commit failed, message and ticket notifications rolled back together"
        );
        ChatError::Persistence(e)
    })?;
    Ok(Persisted::New { message, tickets, admins })
}

/// Push to the receiver side and echo to the sender's other connections.
/// `Support` on either end expands to every admin.
fn deliver(state: &SharedState, message: &Message, admins: &[String], origin: Option<ConnId>) {
    let frame = ServerFrame::NewMessage { message: message.clone() };

    let delivered: usize = match &message.receiver_id {
        Identity::User(user) => state.registry.push(user, &frame),
        Identity::Support => admins.iter().map(|admin| state.registry.push(admin, &frame)).sum(),
    };
    let echoed: usize = match &message.sender_id {
        Identity::User(user) => state.registry.push_except(user, &frame, origin),
        Identity::Support => admins
            .iter()
            .map(|admin| state.registry.push_except(admin, &frame, origin))
            .sum(),
    };
    tracing::debug!(message_id = message.id, delivered, echoed, "message pushed");
}

fn ack(state: &SharedState, message: &Message, origin: Option<ConnId>) {
    if let Some(conn_id) = origin {
        let frame = ServerFrame::Sent { message: message.clone() };
        if !state.registry.send_to(&message.author_id, conn_id, &frame) {
            tracing::debug!(message_id = message.id, conn_id, "ack not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationKind;
    use crate::registry::{Outbox, Registration};
    use crate::server::test_state;
    use tokio::sync::mpsc;

    fn alice() -> Principal {
        Principal::new("alice", Role::Client)
    }

    fn root() -> Principal {
        Principal::new("root", Role::Admin)
    }

    fn req(receiver: &str, content: &str, is_support: bool) -> SendRequest {
        SendRequest {
            receiver_id: Some(receiver.to_string()),
            content: content.to_string(),
            is_support,
            client_msg_id: None,
        }
    }

    fn connect(state: &SharedState, user: &str) -> (Registration, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let reg = state.registry.register(user, state.registry.next_conn_id(), Outbox::new(tx));
        (reg, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn aliasing_table() {
        let bob = Identity::User("bob".into());
        assert_eq!(
            resolve_route(&alice(), Some("anything"), true).unwrap(),
            Route { sender: alice().identity(), receiver: Identity::Support }
        );
        assert_eq!(
            resolve_route(&alice(), None, true).unwrap().receiver,
            Identity::Support
        );
        assert_eq!(
            resolve_route(&root(), Some("alice"), true).unwrap(),
            Route { sender: Identity::Support, receiver: alice().identity() }
        );
        assert_eq!(
            resolve_route(&alice(), Some("bob"), false).unwrap(),
            Route { sender: alice().identity(), receiver: bob }
        );
        assert!(matches!(resolve_route(&root(), None, true), Err(ChatError::Validation(_))));
        assert!(matches!(resolve_route(&root(), Some("support"), true), Err(ChatError::Routing(_))));
        assert!(matches!(resolve_route(&alice(), Some("alice"), false), Err(ChatError::Routing(_))));
    }

    #[test]
    fn direct_message_to_support_is_impersonation() {
        let state = test_state();
        for principal in [alice(), root()] {
            let err = send(&state, &principal, req("support", "hello", false), None).unwrap_err();
            assert!(matches!(err, ChatError::Routing(_)));
        }
        assert!(state.db.lock().messages_after("root", true, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn user_opens_support_ticket() {
        let state = test_state();
        let msg = send(&state, &alice(), req("anything", "help", true), None).unwrap();
        assert_eq!(msg.sender_id, Identity::User("alice".into()));
        assert_eq!(msg.receiver_id, Identity::Support);
        assert!(!msg.read);

        let tickets = state.db.lock().notifications_for("root", false, 10).unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].kind, NotificationKind::SupportTicket);
        assert_eq!(tickets[0].data["messageId"], msg.id);

        // Follow-ups in the same thread do not reopen the ticket.
        send(&state, &alice(), req("", "still there?", true), None).unwrap();
        assert_eq!(state.db.lock().notifications_for("root", false, 10).unwrap().len(), 1);
    }

    #[test]
    fn every_admin_gets_the_ticket() {
        let state = test_state();
        state.db.lock().upsert_user("ops", Role::Admin, None).unwrap();
        send(&state, &alice(), req("", "help", true), None).unwrap();
        let db = state.db.lock();
        assert_eq!(db.notifications_for("root", false, 10).unwrap().len(), 1);
        assert_eq!(db.notifications_for("ops", false, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn admin_reply_reaches_user_live() {
        let state = test_state();
        let (_reg, mut alice_rx) = connect(&state, "alice");

        let msg = send(&state, &root(), req("alice", "hi", true), None).unwrap();
        assert_eq!(msg.sender_id, Identity::Support);
        assert_eq!(msg.receiver_id, Identity::User("alice".into()));
        assert_eq!(msg.author_id, "root");

        match alice_rx.recv().await {
            Some(ServerFrame::NewMessage { message }) => assert_eq!(message, msg),
            other => panic!("expected new_message, got {other:?}"),
        }
        // Admin-initiated thread does not raise a ticket.
        assert!(state.db.lock().notifications_for("root", false, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn support_message_reaches_admin_pool_and_ticket() {
        let state = test_state();
        let (_reg, mut root_rx) = connect(&state, "root");
        send(&state, &alice(), req("", "help", true), None).unwrap();

        let frames = drain(&mut root_rx);
        assert!(matches!(frames[0], ServerFrame::NewMessage { .. }));
        assert!(matches!(frames[1], ServerFrame::Notification { .. }));
    }

    #[tokio::test]
    async fn sender_echo_skips_origin() {
        let state = test_state();
        let (origin, mut origin_rx) = connect(&state, "alice");
        let (_other, mut other_rx) = connect(&state, "alice");
        let (_bob, mut bob_rx) = connect(&state, "bob");

        let msg = send(&state, &alice(), req("bob", "hey", false), Some(origin.conn_id)).unwrap();
        assert_eq!(drain(&mut origin_rx), vec![ServerFrame::Sent { message: msg }]);
        assert_eq!(drain(&mut other_rx).len(), 1);
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }

    #[tokio::test]
    async fn live_order_matches_persisted_order() {
        let state = test_state();
        let (_reg, mut bob_rx) = connect(&state, "bob");
        for i in 0..20 {
            send(&state, &alice(), req("bob", &format!("m{i}"), false), None).unwrap();
        }
        let live: Vec<i64> = drain(&mut bob_rx)
            .into_iter()
            .map(|f| match f {
                ServerFrame::NewMessage { message } => message.id,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let stored: Vec<i64> = state
            .db
            .lock()
            .thread_messages(&Thread::Direct("alice".into(), "bob".into()), None, None)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(live, stored);
        assert_eq!(live.len(), 20);
    }

    #[test]
    fn validation_and_unknown_receiver() {
        let state = test_state();
        assert!(matches!(send(&state, &alice(), req("bob", "   ", false), None), Err(ChatError::Validation(_))));
        let long = "x".repeat(state.config.max_message_len + 1);
        assert!(matches!(send(&state, &alice(), req("bob", &long, false), None), Err(ChatError::Validation(_))));
        assert!(matches!(send(&state, &alice(), req("ghost", "hi", false), None), Err(ChatError::Routing(_))));
        assert!(matches!(send(&state, &root(), req("ghost", "hi", true), None), Err(ChatError::Routing(_))));
    }

    #[test]
    fn support_reply_to_admin_is_refused() {
        let state = test_state();
        state.db.lock().upsert_user("ops", Role::Admin, None).unwrap();
        assert!(matches!(send(&state, &root(), req("ops", "hi", true), None), Err(ChatError::Routing(_))));
    }

    #[tokio::test]
    async fn retry_key_prevents_duplicates() {
        let state = test_state();
        let (_reg, mut bob_rx) = connect(&state, "bob");
        let mut request = req("bob", "once", false);
        request.client_msg_id = Some("retry-1".into());

        let (origin, mut origin_rx) = connect(&state, "alice");
        let first = send(&state, &alice(), request.clone(), Some(origin.conn_id)).unwrap();
        let second = send(&state, &alice(), request, Some(origin.conn_id)).unwrap();
        assert_eq!(first.id, second.id);
        // Both attempts are acked so a client that lost the first ack can settle.
        assert_eq!(drain(&mut origin_rx).len(), 2);
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(
            state.db.lock().thread_messages(&Thread::Direct("alice".into(), "bob".into()), None, None).unwrap().len(),
            1
        );
    }

    #[test]
    fn reused_retry_key_with_different_message_is_rejected() {
        let state = test_state();
        let mut request = req("bob", "once", false);
        request.client_msg_id = Some("retry-1".into());
        send(&state, &alice(), request.clone(), None).unwrap();

        let mut edited = request.clone();
        edited.content = "twice".into();
        assert!(matches!(send(&state, &alice(), edited, None), Err(ChatError::Validation(_))));

        let mut redirected = request;
        redirected.is_support = true;
        assert!(matches!(send(&state, &alice(), redirected, None), Err(ChatError::Validation(_))));

        let thread = Thread::Direct("alice".into(), "bob".into());
        let stored = state.db.lock().thread_messages(&thread, None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "once");
        assert!(state.db.lock().thread_messages(&Thread::Support("alice".into()), None, None).unwrap().is_empty());
    }

    #[test]
    fn failed_ticket_insert_rolls_back_the_message() {
        let state = test_state();
        let (_root_reg, mut root_rx) = connect(&state, "root");
        state.db.lock().fail_notification_inserts().unwrap();

        let result = send(&state, &alice(), req("support", "help", true), None);
        assert!(matches!(result, Err(ChatError::Persistence(_))));

        let db = state.db.lock();
        assert!(db.thread_messages(&Thread::Support("alice".into()), None, None).unwrap().is_empty());
        assert!(db.notifications_for("root", false, 10).unwrap().is_empty());
        drop(db);
        assert!(drain(&mut root_rx).is_empty());
    }

    #[test]
    fn history_thread_selection() {
        assert_eq!(thread_for(&alice(), true, Some("bob")).unwrap(), Thread::Support("alice".into()));
        assert_eq!(thread_for(&root(), true, Some("alice")).unwrap(), Thread::Support("alice".into()));
        assert_eq!(
            thread_for(&alice(), false, Some("bob")).unwrap(),
            Thread::Direct("alice".into(), "bob".into())
        );
        assert!(thread_for(&root(), true, None).is_err());
        assert!(thread_for(&alice(), false, Some("support")).is_err());
    }
}
