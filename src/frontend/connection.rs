//! Transport-independent handling of one client connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::KnobooError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{Outbound, SessionId, SessionManager, SessionState};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on one client frame: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

/// Connection limits shared by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Consecutive protocol errors tolerated before the connection closes.
    pub max_protocol_errors: u32,
    /// Time a client gets to send its handshake.
    pub handshake_timeout: Duration,
    /// Largest frame a client may send.
    pub max_frame_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_protocol_errors: 5,
            handshake_timeout: Duration::from_secs(30),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// What the transport should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Protocol state of one connection.
///
/// Transports feed text frames to [`Connection::handle_frame`] and write
/// whatever arrives on the outbound channel back to the client.
pub struct Connection {
    manager: Arc<SessionManager>,
    outbound: Outbound,
    peer: String,
    config: ConnectionConfig,
    state: SessionState,
    session: Option<SessionId>,
    protocol_errors: u32,
}

impl Connection {
    pub fn new(
        manager: Arc<SessionManager>,
        outbound: Outbound,
        peer: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            manager,
            outbound,
            peer: peer.into(),
            config,
            state: SessionState::Connecting,
            session: None,
            protocol_errors: 0,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Handle one text frame from the client.
    pub async fn handle_frame(&mut self, text: &str) -> Flow {
        if self.state.is_terminal() {
            return Flow::Close;
        }

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => return self.protocol_error(e),
        };

        let Some(session) = self.session else {
            return self.handshake(message).await;
        };

        let result = match message {
            ClientMessage::Handshake { .. } => Err(KnobooError::Protocol(format!(
                "already attached as {}",
                session
            ))),
            ClientMessage::Input { sequence, payload } => self
                .manager
                .route(session, payload, sequence)
                .await
                .map(|_| ()),
            ClientMessage::Restart => self.manager.restart(session).await.map(|_| ()),
            ClientMessage::Ping => self.send(ServerMessage::Pong),
            ClientMessage::Close => return Flow::Close,
        };

        match result {
            Ok(()) => {
                self.protocol_errors = 0;
                Flow::Continue
            }
            Err(e @ KnobooError::Protocol(_)) => self.protocol_error(e),
            Err(KnobooError::SessionNotFound(_)) => Flow::Close,
            Err(e) => {
                debug!(session = %session, "request failed: {}", e);
                self.send(ServerMessage::error(&e)).ok();
                Flow::Continue
            }
        }
    }

    /// Count a frame the transport could not decode.
    ///
    /// Treated like an unparsable frame: a `PROTOCOL_ERROR` reply, and the
    /// connection only closes once the error threshold is reached.
    pub fn handle_malformed(&mut self, reason: &str) -> Flow {
        if self.state.is_terminal() {
            return Flow::Close;
        }
        self.protocol_error(KnobooError::Protocol(reason.to_string()))
    }

    async fn handshake(&mut self, message: ClientMessage) -> Flow {
        let ClientMessage::Handshake {
            notebook_id,
            credentials,
        } = message
        else {
            return self.reject(KnobooError::Protocol("expected handshake".into()));
        };

        match self
            .manager
            .attach(self.outbound.clone(), &notebook_id, &credentials)
            .await
        {
            Ok(attachment) => {
                let _ = self.state.transition_to(SessionState::Authenticated);
                let _ = self.state.transition_to(SessionState::Active);
                self.session = Some(attachment.session);
                info!(
                    peer = %self.peer,
                    session = %attachment.session,
                    notebook = %notebook_id,
                    "client attached"
                );
                Flow::Continue
            }
            Err(e) => self.reject(e),
        }
    }

    /// Refuse the handshake and close.
    fn reject(&mut self, error: KnobooError) -> Flow {
        warn!(peer = %self.peer, code = error.code(), "handshake rejected: {}", error);
        self.send(ServerMessage::error(&error)).ok();
        if self.state.transition_to(SessionState::Closed).is_err() {
            self.state = SessionState::Closed;
        }
        Flow::Close
    }

    fn protocol_error(&mut self, error: KnobooError) -> Flow {
        if self.session.is_none() {
            return self.reject(error);
        }

        self.protocol_errors += 1;
        debug!(peer = %self.peer, count = self.protocol_errors, "protocol error: {}", error);
        self.send(ServerMessage::error(&error)).ok();
        if self.protocol_errors >= self.config.max_protocol_errors {
            warn!(peer = %self.peer, "too many protocol errors, closing");
            return Flow::Close;
        }
        Flow::Continue
    }

    fn send(&self, message: ServerMessage) -> crate::Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| KnobooError::ChannelClosed)
    }

    /// Tear down the session, if one was attached.
    pub async fn finish(mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.manager.detach(session).await {
                debug!(session = %session, "detach failed: {}", e);
            }
        }
        if self.state.is_active() {
            let _ = self.state.transition_to(SessionState::Closing);
        }
        let _ = self.state.transition_to(SessionState::Closed);
        debug!(peer = %self.peer, state = ?self.state, "connection finished");
    }
}

/// Wait for queued frames to drain once the session is gone.
///
/// The writer ends when every sender of the outbound channel is dropped.
pub async fn flush(mut writer: JoinHandle<()>, peer: &str) {
    match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(peer = %peer, "writer ended abnormally: {}", e),
        Err(_) => {
            debug!(peer = %peer, "writer did not drain in time");
            writer.abort();
        }
    }
}
