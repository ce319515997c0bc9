//! One authenticated client's attachment to a notebook kernel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::route::{KernelRoute, Outbound};
use super::{SessionId, SessionState};
use crate::error::KnobooError;
use crate::kernel::ProcessId;
use crate::notebook::{Access, NotebookId};
use crate::protocol::ServerMessage;
use crate::realm::Avatar;
use crate::Result;

/// What a session may do with its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Writer,
    Viewer,
}

impl Role {
    pub fn for_access(access: Access) -> Option<Role> {
        if access.can_write() {
            Some(Role::Writer)
        } else if access.can_read() {
            Some(Role::Viewer)
        } else {
            None
        }
    }
}

/// A client session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    notebook: NotebookId,
    avatar: Avatar,
    role: Role,
    state: SessionState,
    attachment: Option<Arc<KernelRoute>>,
    sequence: u64,
    outbound: Outbound,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    /// Open a session for `avatar` on `notebook`.
    ///
    /// Fails with [`KnobooError::Authorization`] when the avatar may not
    /// attach or holds no access to the notebook.
    pub fn open(
        notebook: NotebookId,
        avatar: Avatar,
        access: Access,
        outbound: Outbound,
    ) -> Result<Self> {
        let mut state = SessionState::Connecting;
        let role = Role::for_access(access).filter(|_| avatar.can_attach());
        let Some(role) = role else {
            state.transition_to(SessionState::Closed)?;
            return Err(KnobooError::Authorization(format!(
                "{} may not open {}",
                avatar.user(),
                notebook
            )));
        };
        state.transition_to(SessionState::Authenticated)?;

        let now = Instant::now();
        Ok(Self {
            id: SessionId::new(),
            notebook,
            avatar,
            role,
            state,
            attachment: None,
            sequence: 0,
            outbound,
            created_at: now,
            last_activity: now,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn notebook(&self) -> &NotebookId {
        &self.notebook
    }

    pub fn avatar(&self) -> &Avatar {
        &self.avatar
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last sequence number issued.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Kernel this session is attached to, if any.
    pub fn process(&self) -> Option<ProcessId> {
        self.attachment.as_ref().map(|route| route.process())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Bind to a kernel and start receiving its output.
    pub fn activate(&mut self, route: Arc<KernelRoute>, exclusive: bool) -> Result<()> {
        if self.state != SessionState::Authenticated {
            return Err(KnobooError::InvalidStateTransition {
                from: self.state,
                to: SessionState::Active,
            });
        }
        route.subscribe(self.id, self.role, self.outbound.clone(), exclusive)?;
        self.state.transition_to(SessionState::Active)?;
        self.attachment = Some(route);
        self.touch();
        Ok(())
    }

    /// Bind an active session that lost its kernel to a new one.
    pub fn reattach(&mut self, route: Arc<KernelRoute>, exclusive: bool) -> Result<()> {
        if !self.state.is_active() {
            return Err(KnobooError::SessionNotFound(self.id.to_string()));
        }
        if self.attachment.is_some() {
            return Err(KnobooError::Protocol(format!(
                "{} is still attached",
                self.id
            )));
        }
        route.subscribe(self.id, self.role, self.outbound.clone(), exclusive)?;
        self.attachment = Some(route);
        self.touch();
        Ok(())
    }

    /// Forget the current kernel. The session stays open.
    pub fn detach_process(&mut self) -> Option<ProcessId> {
        let route = self.attachment.take()?;
        route.unsubscribe(self.id);
        Some(route.process())
    }

    /// Send one request to the kernel and return its sequence number.
    ///
    /// `expected`, when given, must equal the next sequence number.
    pub async fn send(&mut self, payload: Value, expected: Option<u64>) -> Result<u64> {
        if !self.state.is_active() {
            return Err(KnobooError::SessionNotFound(self.id.to_string()));
        }
        if self.role != Role::Writer {
            return Err(KnobooError::ReadOnly);
        }
        let route = self.attachment.clone().ok_or_else(|| {
            KnobooError::ProcessCrashed("no kernel attached, send restart".into())
        })?;

        let next = self.sequence + 1;
        if let Some(expected) = expected {
            if expected != next {
                return Err(KnobooError::Protocol(format!(
                    "expected sequence {}, got {}",
                    next, expected
                )));
            }
        }

        route.submit(self.id, next, payload).await?;
        self.sequence = next;
        self.touch();
        Ok(next)
    }

    /// Queue a message for this session's connection.
    pub fn deliver(&self, message: ServerMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| KnobooError::ChannelClosed)
    }

    /// Release the kernel and walk the session to `Closed`.
    ///
    /// The kernel itself keeps running. Returns the released process.
    pub fn close(&mut self) -> Result<Option<ProcessId>> {
        if self.state.is_active() {
            self.state.transition_to(SessionState::Closing)?;
        }
        let released = self.detach_process();
        self.state.transition_to(SessionState::Closed)?;
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Framing;
    use crate::protocol::PayloadKind;
    use crate::realm::Permissions;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn avatar(name: &str) -> Avatar {
        Avatar::new(name.into(), Permissions::ATTACH_SESSIONS)
    }

    fn route() -> (Arc<KernelRoute>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        let route = KernelRoute::new(ProcessId::from_raw(9), "nb".into(), tx, Framing::Raw);
        (Arc::new(route), rx)
    }

    fn open(access: Access) -> (Session, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::open("nb".into(), avatar("alice"), access, tx).unwrap();
        (session, rx)
    }

    #[test]
    fn test_open_roles() {
        assert_eq!(open(Access::Owner).0.role(), Role::Writer);
        assert_eq!(open(Access::Collaborator).0.role(), Role::Writer);
        assert_eq!(open(Access::Viewer).0.role(), Role::Viewer);
        assert_eq!(open(Access::Owner).0.state(), SessionState::Authenticated);
    }

    #[test]
    fn test_open_without_access() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Session::open("nb".into(), avatar("mallory"), Access::None, tx);
        assert!(matches!(result, Err(KnobooError::Authorization(_))));

        let (tx, _rx) = mpsc::unbounded_channel();
        let powerless = Avatar::new("x".into(), Permissions::NONE);
        let result = Session::open("nb".into(), powerless, Access::Owner, tx);
        assert!(matches!(result, Err(KnobooError::Authorization(_))));
    }

    #[tokio::test]
    async fn test_send_sequences_in_order() {
        let (route, mut kernel) = route();
        let (mut session, _rx) = open(Access::Owner);
        session.activate(route, false).unwrap();
        assert_eq!(session.state(), SessionState::Active);

        for i in 1..=5u64 {
            let seq = session.send(json!(format!("cell {}", i)), None).await.unwrap();
            assert_eq!(seq, i);
        }
        for i in 1..=5u64 {
            let frame = kernel.recv().await.unwrap();
            assert_eq!(frame, format!("cell {}\n", i).into_bytes());
        }
    }

    #[tokio::test]
    async fn test_send_checks_expected_sequence() {
        let (route, _kernel) = route();
        let (mut session, _rx) = open(Access::Owner);
        session.activate(route, false).unwrap();

        assert_eq!(session.send(json!("a"), Some(1)).await.unwrap(), 1);
        let err = session.send(json!("b"), Some(5)).await.unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert_eq!(session.sequence(), 1);
    }

    #[tokio::test]
    async fn test_viewer_is_read_only() {
        let (route, _kernel) = route();
        let (mut session, _rx) = open(Access::Viewer);
        session.activate(route, false).unwrap();
        let err = session.send(json!("x"), None).await.unwrap_err();
        assert!(matches!(err, KnobooError::ReadOnly));
    }

    #[tokio::test]
    async fn test_send_without_kernel() {
        let (route, _kernel) = route();
        let (mut session, _rx) = open(Access::Owner);
        session.activate(route, false).unwrap();
        assert_eq!(session.detach_process(), Some(ProcessId::from_raw(9)));

        let err = session.send(json!("x"), None).await.unwrap_err();
        assert_eq!(err.code(), "PROCESS_CRASHED");
    }

    #[tokio::test]
    async fn test_output_reaches_session() {
        let (route, _kernel) = route();
        let (mut session, mut rx) = open(Access::Viewer);
        session.activate(Arc::clone(&route), false).unwrap();

        route.dispatch(&crate::kernel::KernelOutput::stdout(b"42".to_vec()));
        match rx.recv().await.unwrap() {
            ServerMessage::Envelope(env) => {
                assert_eq!(env.kind, PayloadKind::Output);
                assert_eq!(env.payload, json!("42"));
            }
            other => panic!("Expected Envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_close_releases_process() {
        let (route, _kernel) = route();
        let (mut session, _rx) = open(Access::Owner);
        session.activate(Arc::clone(&route), false).unwrap();
        assert_eq!(route.subscriber_count(), 1);

        assert_eq!(session.close().unwrap(), Some(ProcessId::from_raw(9)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(route.subscriber_count(), 0);
        assert!(session.close().is_err());
    }

    #[test]
    fn test_reattach_requires_detached() {
        let (first, _k1) = route();
        let (second, _k2) = route();
        let (mut session, _rx) = open(Access::Owner);
        session.activate(first, false).unwrap();
        assert!(session.reattach(Arc::clone(&second), false).is_err());

        session.detach_process();
        session.reattach(second, false).unwrap();
        assert_eq!(session.process(), Some(ProcessId::from_raw(9)));
    }
}
