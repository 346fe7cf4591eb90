//! Session registry: the shared set of open sessions plus message routing.
//!
//! Holds a non-owning reference to every joined session together with the
//! identity it signed in with. A single mutex guards the member table, and
//! with it every session's `peer_id`. Delivery to sessions always happens
//! after the lock is released: recipients are snapshotted as weak handles
//! under the lock and upgraded outside it.

use crate::session::{Session, SessionId};
use sigrelay_core::{
    encode_chat, encode_error, encode_nop, encode_ok, encode_sign_in_ok, parse, Command, ErrorKind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, warn};

/// A joined session as seen by the registry.
struct Member {
    /// Identity set by a successful sign-in; empty while unauthenticated.
    peer_id: String,
    session: Weak<Session>,
}

impl Member {
    /// A member whose session is already being torn down no longer counts
    /// as holding its identity.
    fn is_live(&self) -> bool {
        self.session.strong_count() > 0
    }
}

/// Process-wide registry of open sessions.
pub struct Registry {
    /// Carried for static-file configuration; unused by routing.
    doc_root: PathBuf,
    max_connections: u32,
    members: Mutex<HashMap<SessionId, Member>>,
}

impl Registry {
    /// Create an empty registry that admits at most `max_connections` sessions.
    pub fn new(doc_root: impl Into<PathBuf>, max_connections: u32) -> Self {
        Self {
            doc_root: doc_root.into(),
            max_connections,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Number of joined sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Member>> {
        // Critical sections never panic midway, so the table stays consistent.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Membership ─────────────────────────────────────────────────────

    /// Add a session. Returns `false` when the registry is full; the caller
    /// must close the connection rather than retry. Joining again is a no-op
    /// that keeps the existing identity.
    pub fn join(&self, session: &Arc<Session>) -> bool {
        let mut members = self.lock();
        if members.contains_key(&session.id()) {
            return true;
        }
        if members.len() + 1 > self.max_connections as usize {
            warn!(
                session = session.id(),
                max_connections = self.max_connections,
                "registry full"
            );
            return false;
        }
        members.insert(
            session.id(),
            Member {
                peer_id: String::new(),
                session: Arc::downgrade(session),
            },
        );
        debug!(session = session.id(), count = members.len(), "session joined");
        true
    }

    /// Remove a session. Removing an absent session is a no-op.
    pub fn leave(&self, session: &Session) {
        let mut members = self.lock();
        if let Some(member) = members.remove(&session.id()) {
            debug!(
                session = session.id(),
                peer_id = %member.peer_id,
                count = members.len(),
                "session left"
            );
        }
    }

    /// Identity the session signed in with, if any.
    pub fn peer_id_of(&self, session: &Session) -> Option<String> {
        self.lock()
            .get(&session.id())
            .map(|m| m.peer_id.clone())
            .filter(|id| !id.is_empty())
    }

    /// Look up the live session signed in as `id`.
    pub fn find(&self, id: &str) -> Option<Arc<Session>> {
        if id.is_empty() {
            return None;
        }
        let candidates = self.snapshot(|m| m.peer_id == id);
        candidates.iter().find_map(Weak::upgrade)
    }

    /// Whether a live session is signed in as `id`.
    pub fn exists(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }
        self.lock()
            .values()
            .any(|m| m.peer_id == id && m.is_live())
    }

    /// Collect weak handles to every member matching `pred`, under the lock.
    /// Upgrading happens at the call site, after the lock is released.
    fn snapshot(&self, pred: impl Fn(&Member) -> bool) -> Vec<Weak<Session>> {
        let members = self.lock();
        members
            .values()
            .filter(|m| pred(m))
            .map(|m| m.session.clone())
            .collect()
    }

    // ── Dispatch ───────────────────────────────────────────────────────

    /// Handle one inbound frame from `session` and build the direct reply.
    ///
    /// Returns `None` for commands that produce no reply (`SIGN_OUT`).
    /// Malformed frames never end the session; they yield `invalidRequest`.
    pub fn handle_message(&self, session: &Session, text: &str) -> Option<String> {
        let command = match parse(text) {
            Ok(command) => command,
            Err(e) => {
                debug!(session = session.id(), error = %e, "undecodable frame");
                return Some(encode_error(ErrorKind::InvalidRequest));
            }
        };

        debug!(session = session.id(), command = ?command.message_id(), "dispatch");

        match command {
            Command::Nop => Some(encode_nop()),
            Command::SignIn { id } => Some(self.sign_in(session, id)),
            // Reserved: accepted but has no effect and no reply yet.
            Command::SignOut => None,
            Command::SendMessage { to, msg } => {
                let from = self.peer_id_of(session).unwrap_or_default();
                Some(self.send_message(&from, &to, &msg))
            }
            Command::Unknown => Some(encode_error(ErrorKind::InvalidRequest)),
        }
    }

    /// Bind `id` to `session`. Check and set happen under one lock hold so
    /// concurrent sign-ins for the same id cannot both win.
    fn sign_in(&self, session: &Session, id: String) -> String {
        if id.is_empty() {
            return encode_error(ErrorKind::IdIsEmpty);
        }

        let mut members = self.lock();
        if members.values().any(|m| m.peer_id == id && m.is_live()) {
            debug!(session = session.id(), peer_id = %id, "id already connected");
            return encode_error(ErrorKind::IdIsAlreadyConnected);
        }

        let Some(member) = members.get_mut(&session.id()) else {
            warn!(session = session.id(), "sign-in from a session that never joined");
            return encode_error(ErrorKind::InternalError);
        };
        if !member.peer_id.is_empty() {
            return encode_error(ErrorKind::AlreadySignedIn);
        }
        member.peer_id = id;
        info!(session = session.id(), peer_id = %member.peer_id, "signed in");
        encode_sign_in_ok()
    }

    /// Validate and relay a chat message, returning the sender's reply.
    pub fn send_message(&self, from: &str, to: &str, msg: &str) -> String {
        if to.is_empty() || msg.is_empty() {
            return encode_error(ErrorKind::InvalidRequest);
        }
        if self.send_to(from, to, msg) > 0 {
            encode_ok(None)
        } else {
            encode_error(ErrorKind::RecipientNotFound)
        }
    }

    /// Hand `{from, msg}` to every live session signed in as `to`.
    /// Returns the number of sessions the payload was handed to.
    pub fn send_to(&self, from: &str, to: &str, msg: &str) -> usize {
        if to.is_empty() {
            return 0;
        }
        let recipients = self.snapshot(|m| m.peer_id == to);

        let frame = encode_chat(from, msg);
        let mut delivered = 0;
        for weak in &recipients {
            if let Some(session) = weak.upgrade() {
                session.send(frame.clone());
                delivered += 1;
            }
        }
        debug!(from = %from, to = %to, delivered, "relayed message");
        delivered
    }

    /// Broadcast a raw frame to every joined session.
    /// Returns the number of sessions the frame was handed to.
    pub fn send(&self, message: &str) -> usize {
        let recipients = self.snapshot(|_| true);

        let mut delivered = 0;
        for weak in &recipients {
            if let Some(session) = weak.upgrade() {
                session.send(message.to_string());
                delivered += 1;
            }
        }
        debug!(delivered, "broadcast");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Barrier;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry(max: u32) -> Arc<Registry> {
        Arc::new(Registry::new(".", max))
    }

    fn joined(registry: &Arc<Registry>) -> (Arc<Session>, UnboundedReceiver<String>) {
        let (session, rx) = Session::new(registry.clone(), None);
        assert!(registry.join(&session));
        (session, rx)
    }

    fn reply(registry: &Registry, session: &Session, frame: Value) -> Value {
        let text = registry
            .handle_message(session, &frame.to_string())
            .expect("expected a reply");
        serde_json::from_str(&text).unwrap()
    }

    fn sign_in(registry: &Registry, session: &Session, id: &str) -> Value {
        reply(registry, session, json!({"cmd": 1, "data": {"id": id}}))
    }

    #[test]
    fn capacity_is_enforced_at_join() {
        let registry = registry(2);
        let (a, _ra) = joined(&registry);
        let (_b, _rb) = joined(&registry);
        let (c, _rc) = Session::new(registry.clone(), None);
        assert!(!registry.join(&c));
        assert_eq!(registry.len(), 2);

        registry.leave(&a);
        assert!(registry.join(&c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn rejoin_keeps_identity() {
        let registry = registry(1);
        let (alice, _ra) = joined(&registry);
        assert_eq!(sign_in(&registry, &alice, "alice"), json!({"res": 0, "data.cmd": 1}));

        // full, but alice is already a member
        assert!(registry.join(&alice));
        assert_eq!(registry.len(), 1);
        assert!(registry.exists("alice"));
        assert_eq!(alice.peer_id().as_deref(), Some("alice"));
    }

    #[test]
    fn nop_acknowledges() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        assert_eq!(reply(&registry, &a, json!({"cmd": 0})), json!({"res": 0, "data": "NOP"}));
    }

    #[test]
    fn sign_in_sets_peer_id() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        assert_eq!(sign_in(&registry, &a, "alice"), json!({"res": 0, "data.cmd": 1}));
        assert_eq!(a.peer_id().as_deref(), Some("alice"));
        assert!(registry.exists("alice"));
        assert!(Arc::ptr_eq(&registry.find("alice").unwrap(), &a));
    }

    #[test]
    fn empty_id_rejected() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        assert_eq!(sign_in(&registry, &a, ""), json!({"res": 1, "error": "Id is empty"}));
        let missing = reply(&registry, &a, json!({"cmd": 1}));
        assert_eq!(missing, json!({"res": 1, "error": "Id is empty"}));
        assert!(a.peer_id().is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        let (b, _rb) = joined(&registry);
        sign_in(&registry, &a, "alice");
        assert_eq!(
            sign_in(&registry, &b, "alice"),
            json!({"res": 1, "error": "Id is already connected"})
        );
        assert!(b.peer_id().is_none());
    }

    #[test]
    fn second_sign_in_with_new_id_rejected() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        sign_in(&registry, &a, "alice");
        assert_eq!(
            sign_in(&registry, &a, "carol"),
            json!({"res": 1, "error": "Already signed in"})
        );
        assert_eq!(a.peer_id().as_deref(), Some("alice"));
        assert!(!registry.exists("carol"));
    }

    #[test]
    fn sign_in_without_join_is_internal_error() {
        let registry = registry(4);
        let (loose, _rx) = Session::new(registry.clone(), None);
        assert_eq!(
            sign_in(&registry, &loose, "alice"),
            json!({"res": 1, "error": "Internal error"})
        );
    }

    #[test]
    fn concurrent_sign_ins_have_one_winner() {
        let registry = registry(16);
        let sessions: Vec<_> = (0..8).map(|_| joined(&registry)).collect();
        let barrier = Arc::new(Barrier::new(sessions.len()));

        let handles: Vec<_> = sessions
            .iter()
            .map(|(session, _)| {
                let registry = registry.clone();
                let session = session.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    sign_in(&registry, &session, "alice")["res"] == json!(0)
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn routes_to_recipient_only() {
        let registry = registry(4);
        let (a, mut ra) = joined(&registry);
        let (b, mut rb) = joined(&registry);
        let (_c, mut rc) = joined(&registry);
        sign_in(&registry, &a, "alice");
        sign_in(&registry, &b, "bob");

        let res = reply(&registry, &a, json!({"cmd": 3, "data": {"to": "bob", "msg": "hi"}}));
        assert_eq!(res, json!({"res": 0}));

        let relayed: Value = serde_json::from_str(&rb.try_recv().unwrap()).unwrap();
        assert_eq!(relayed, json!({"from": "alice", "msg": "hi"}));
        assert!(ra.try_recv().is_err());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn unknown_recipient() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        sign_in(&registry, &a, "alice");
        let res = reply(&registry, &a, json!({"cmd": 3, "data": {"to": "nobody", "msg": "hi"}}));
        assert_eq!(res, json!({"res": 1, "error": "Recipient not Found"}));
    }

    #[test]
    fn empty_recipient_or_message_is_invalid() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        let (b, mut rb) = joined(&registry);
        sign_in(&registry, &b, "bob");
        let no_msg = reply(&registry, &a, json!({"cmd": 3, "data": {"to": "bob"}}));
        assert_eq!(no_msg, json!({"res": 1, "error": "Invalid message"}));
        let no_to = reply(&registry, &a, json!({"cmd": 3, "data": {"msg": "hi"}}));
        assert_eq!(no_to, json!({"res": 1, "error": "Invalid message"}));
        assert!(rb.try_recv().is_err());
    }

    #[test]
    fn unauthenticated_sender_relays_with_empty_from() {
        let registry = registry(4);
        let (anon, _ranon) = joined(&registry);
        let (b, mut rb) = joined(&registry);
        sign_in(&registry, &b, "bob");
        let res = reply(&registry, &anon, json!({"cmd": 3, "data": {"to": "bob", "msg": "psst"}}));
        assert_eq!(res, json!({"res": 0}));
        let relayed: Value = serde_json::from_str(&rb.try_recv().unwrap()).unwrap();
        assert_eq!(relayed, json!({"from": "", "msg": "psst"}));
    }

    #[test]
    fn malformed_and_unknown_frames_are_invalid() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        assert_eq!(
            registry.handle_message(&a, "not json").as_deref(),
            Some(r#"{"res":1,"error":"Invalid message"}"#)
        );
        assert_eq!(
            reply(&registry, &a, json!({"cmd": 42})),
            json!({"res": 1, "error": "Invalid message"})
        );
        // still usable afterwards
        assert_eq!(reply(&registry, &a, json!({"cmd": 0}))["res"], json!(0));
    }

    #[test]
    fn sign_out_is_silent() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        sign_in(&registry, &a, "alice");
        assert!(registry.handle_message(&a, r#"{"cmd":2}"#).is_none());
        assert!(registry.exists("alice"));
    }

    #[test]
    fn dropping_session_releases_identity() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        sign_in(&registry, &a, "alice");
        drop(a);

        assert!(!registry.exists("alice"));
        assert!(registry.find("alice").is_none());
        assert!(registry.is_empty());

        let (b, _rb) = joined(&registry);
        assert_eq!(sign_in(&registry, &b, "alice")["res"], json!(0));
    }

    #[test]
    fn leave_is_idempotent() {
        let registry = registry(4);
        let (a, _ra) = joined(&registry);
        let (b, _rb) = joined(&registry);
        sign_in(&registry, &b, "bob");

        registry.leave(&a);
        registry.leave(&a);
        assert_eq!(registry.len(), 1);
        assert!(registry.exists("bob"));
    }

    #[test]
    fn broadcast_reaches_every_session() {
        let registry = registry(4);
        let (_a, mut ra) = joined(&registry);
        let (_b, mut rb) = joined(&registry);
        assert_eq!(registry.send("hello all"), 2);
        assert_eq!(ra.try_recv().unwrap(), "hello all");
        assert_eq!(rb.try_recv().unwrap(), "hello all");
    }

    #[test]
    fn send_to_empty_identity_matches_nobody() {
        let registry = registry(4);
        let (_anon, mut ranon) = joined(&registry);
        assert_eq!(registry.send_to("x", "", "hi"), 0);
        assert!(ranon.try_recv().is_err());
    }

    #[test]
    fn lookups_ignore_empty_identity() {
        let registry = registry(4);
        let (_anon, _r) = joined(&registry);
        assert!(!registry.exists(""));
        assert!(registry.find("").is_none());
    }

    #[test]
    fn exposes_configuration() {
        let registry = Registry::new("/srv/www", 7);
        assert_eq!(registry.doc_root(), Path::new("/srv/www"));
        assert_eq!(registry.max_connections(), 7);
    }
}
