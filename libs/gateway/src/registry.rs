use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use relay_core::{ConversationId, SocketId, UserId};
use serde_json::Value;

use crate::session::Session;

/// All sessions this instance hosts, indexed by socket, user, and room.
/// Never holds a lock across an emit: emission goes through each session's
/// outbound channel.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SocketId, Arc<Session>>,
    by_user: DashMap<UserId, HashSet<SocketId>>,
    rooms: DashMap<ConversationId, HashSet<SocketId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.by_user
            .entry(session.user_id.clone())
            .or_default()
            .insert(session.socket_id.clone());
        self.sessions.insert(session.socket_id.clone(), session);
    }

    /// Removes the session from every index; returns it if it was present.
    pub fn remove(&self, socket: &SocketId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(socket)?;
        if let Some(mut sockets) = self.by_user.get_mut(&session.user_id) {
            sockets.remove(socket);
        }
        self.by_user
            .remove_if(&session.user_id, |_, sockets| sockets.is_empty());
        self.rooms.iter_mut().for_each(|mut room| {
            room.remove(socket);
        });
        self.rooms.retain(|_, members| !members.is_empty());
        Some(session)
    }

    pub fn get(&self, socket: &SocketId) -> Option<Arc<Session>> {
        self.sessions.get(socket).map(|s| s.clone())
    }

    pub fn join_room(&self, conversation: &ConversationId, socket: &SocketId) {
        self.rooms
            .entry(conversation.clone())
            .or_default()
            .insert(socket.clone());
    }

    pub fn leave_room(&self, conversation: &ConversationId, socket: &SocketId) {
        if let Some(mut room) = self.rooms.get_mut(conversation) {
            room.remove(socket);
        }
        self.rooms.remove_if(conversation, |_, members| members.is_empty());
    }

    pub fn in_room(&self, conversation: &ConversationId, socket: &SocketId) -> bool {
        self.rooms
            .get(conversation)
            .is_some_and(|room| room.contains(socket))
    }

    pub fn sessions_of_user(&self, user: &UserId) -> Vec<Arc<Session>> {
        let sockets: Vec<SocketId> = match self.by_user.get(user) {
            Some(sockets) => sockets.iter().cloned().collect(),
            None => return Vec::new(),
        };
        sockets
            .iter()
            .filter_map(|socket| self.get(socket))
            .collect()
    }

    fn room_sockets(&self, conversation: &ConversationId) -> Vec<SocketId> {
        self.rooms
            .get(conversation)
            .map(|room| room.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Emits a non-message event to every room session except `except`.
    pub fn broadcast_to_room(
        &self,
        conversation: &ConversationId,
        except: Option<&SocketId>,
        event: &str,
        data: &Value,
    ) {
        for socket in self.room_sockets(conversation) {
            if Some(&socket) == except {
                continue;
            }
            if let Some(session) = self.get(&socket) {
                session.emit(event, data.clone());
            }
        }
    }

    /// Emits a message-bearing event (deduped per session) to the room.
    pub fn emit_message_to_room(
        &self,
        conversation: &ConversationId,
        except: Option<&SocketId>,
        event: &str,
        payload: &Value,
    ) {
        for socket in self.room_sockets(conversation) {
            if Some(&socket) == except {
                continue;
            }
            if let Some(session) = self.get(&socket) {
                session.emit_message(event, payload.clone());
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerFrame;
    use relay_core::{ClientMeta, CorrelationId};
    use tokio::sync::mpsc;

    fn session(socket: &str, user: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Session::new(
                SocketId::from(socket),
                UserId::from(user),
                CorrelationId::generate(),
                ClientMeta::default(),
                200,
                tx,
            )),
            rx,
        )
    }

    #[test]
    fn rooms_track_membership() {
        let registry = SessionRegistry::new();
        let (s1, _rx1) = session("s-1", "u-1");
        let conv = ConversationId::from("c-1");
        registry.insert(s1.clone());
        registry.join_room(&conv, &s1.socket_id);
        assert!(registry.in_room(&conv, &s1.socket_id));
        registry.leave_room(&conv, &s1.socket_id);
        assert!(!registry.in_room(&conv, &s1.socket_id));
    }

    #[test]
    fn broadcast_skips_the_excluded_socket() {
        let registry = SessionRegistry::new();
        let (s1, mut rx1) = session("s-1", "u-1");
        let (s2, mut rx2) = session("s-2", "u-2");
        let conv = ConversationId::from("c-1");
        registry.insert(s1.clone());
        registry.insert(s2.clone());
        registry.join_room(&conv, &s1.socket_id);
        registry.join_room(&conv, &s2.socket_id);

        registry.broadcast_to_room(
            &conv,
            Some(&s1.socket_id),
            "user_typing",
            &serde_json::json!({"conversationId": "c-1"}),
        );
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().event, "user_typing");
    }

    #[test]
    fn remove_clears_all_indexes() {
        let registry = SessionRegistry::new();
        let (s1, _rx) = session("s-1", "u-1");
        let conv = ConversationId::from("c-1");
        registry.insert(s1.clone());
        registry.join_room(&conv, &s1.socket_id);

        let removed = registry.remove(&s1.socket_id).expect("session");
        assert_eq!(removed.socket_id, s1.socket_id);
        assert!(registry.get(&s1.socket_id).is_none());
        assert!(registry.sessions_of_user(&UserId::from("u-1")).is_empty());
        assert!(!registry.in_room(&conv, &s1.socket_id));
    }

    #[test]
    fn a_user_may_hold_multiple_sessions() {
        let registry = SessionRegistry::new();
        let (s1, _rx1) = session("s-1", "u-1");
        let (s2, _rx2) = session("s-2", "u-1");
        registry.insert(s1);
        registry.insert(s2);
        assert_eq!(registry.sessions_of_user(&UserId::from("u-1")).len(), 2);
    }
}
