//! Per-kernel multiplexer between sessions and one process.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{Role, SessionId};
use crate::error::KnobooError;
use crate::kernel::{Framing, KernelOutput, ProcessId};
use crate::notebook::NotebookId;
use crate::protocol::{decode_reply, encode_request, Envelope, PayloadKind, RequestTags, ServerMessage};
use crate::Result;

/// Outbound half of a client connection.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

struct Subscriber {
    role: Role,
    outbound: Outbound,
}

#[derive(Default)]
struct RouteInner {
    subscribers: BTreeMap<SessionId, Subscriber>,
    tags: RequestTags,
}

/// Fan-out point for one kernel.
///
/// Writers submit requests through [`KernelRoute::submit`]; every line the
/// kernel prints is delivered to all subscribed sessions, attributed to the
/// session and sequence number of the request that produced it.
pub struct KernelRoute {
    process: ProcessId,
    notebook: NotebookId,
    framing: Framing,
    input: mpsc::Sender<Vec<u8>>,
    submit: tokio::sync::Mutex<()>,
    inner: Mutex<RouteInner>,
}

impl KernelRoute {
    pub fn new(
        process: ProcessId,
        notebook: NotebookId,
        input: mpsc::Sender<Vec<u8>>,
        framing: Framing,
    ) -> Self {
        Self {
            process,
            notebook,
            framing,
            input,
            submit: tokio::sync::Mutex::new(()),
            inner: Mutex::new(RouteInner::default()),
        }
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn notebook(&self) -> &NotebookId {
        &self.notebook
    }

    fn inner(&self) -> MutexGuard<'_, RouteInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(process = %self.process, "recovering from poisoned route lock");
            poisoned.into_inner()
        })
    }

    /// Add a session to the fan-out set.
    ///
    /// With `exclusive` set, a second writer is refused.
    pub fn subscribe(
        &self,
        session: SessionId,
        role: Role,
        outbound: Outbound,
        exclusive: bool,
    ) -> Result<()> {
        let mut inner = self.inner();
        if exclusive && role == Role::Writer {
            let holder = inner
                .subscribers
                .iter()
                .find(|(id, sub)| **id != session && sub.role == Role::Writer)
                .map(|(id, _)| *id);
            if let Some(holder) = holder {
                return Err(KnobooError::NotebookBusy(format!(
                    "{} is held by {}",
                    self.notebook, holder
                )));
            }
        }
        inner.subscribers.insert(session, Subscriber { role, outbound });
        debug!(process = %self.process, session = %session, ?role, "session subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, session: SessionId) -> bool {
        self.inner().subscribers.remove(&session).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner().subscribers.len()
    }

    pub fn writer_count(&self) -> usize {
        self.inner()
            .subscribers
            .values()
            .filter(|sub| sub.role == Role::Writer)
            .count()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.inner().subscribers.keys().copied().collect()
    }

    /// Send one request to the kernel.
    ///
    /// The input is echoed to every subscriber before the frame is queued,
    /// and frames reach the kernel in the order their tags were issued.
    pub async fn submit(&self, session: SessionId, sequence: u64, payload: Value) -> Result<()> {
        let _order = self.submit.lock().await;

        let frame = {
            let mut inner = self.inner();
            let tag = inner.tags.register(session, sequence);
            let frame = encode_request(self.framing, tag, &payload)?;
            let echo = Envelope::new(session, sequence, PayloadKind::Input, payload);
            fan_out(&mut inner, |_| echo.clone().into());
            frame
        };

        trace!(process = %self.process, session = %session, sequence, "request queued");
        self.input.send(frame).await.map_err(|_| {
            KnobooError::ProcessCrashed(format!("{} no longer accepts input", self.process))
        })
    }

    /// Deliver one line of kernel output to every subscriber.
    pub fn dispatch(&self, output: &KernelOutput) {
        let reply = decode_reply(self.framing, output);
        let mut inner = self.inner();
        let origin = inner.tags.resolve(reply.tag);

        fan_out(&mut inner, |recipient| {
            let (session, sequence) = match origin {
                Some(origin) => (origin.session, origin.sequence),
                None => (recipient, 0),
            };
            Envelope::new(session, sequence, reply.kind, reply.payload.clone()).into()
        });
    }

    /// Push a message to every subscriber.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let mut inner = self.inner();
        fan_out(&mut inner, |_| message.clone())
    }

    /// Notify every subscriber that the kernel is gone and drop them all.
    ///
    /// Returns the sessions that were attached.
    pub fn fail<F>(&self, notice: F) -> Vec<SessionId>
    where
        F: Fn(SessionId) -> ServerMessage,
    {
        let mut inner = self.inner();
        let subscribers = std::mem::take(&mut inner.subscribers);
        subscribers
            .into_iter()
            .map(|(id, sub)| {
                let _ = sub.outbound.send(notice(id));
                id
            })
            .collect()
    }
}

impl std::fmt::Debug for KernelRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRoute")
            .field("process", &self.process)
            .field("notebook", &self.notebook)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Send a message built per recipient, dropping closed connections.
fn fan_out<F>(inner: &mut RouteInner, message: F) -> usize
where
    F: Fn(SessionId) -> ServerMessage,
{
    let mut delivered = 0;
    inner.subscribers.retain(|id, sub| {
        if sub.outbound.send(message(*id)).is_ok() {
            delivered += 1;
            true
        } else {
            debug!(session = %id, "dropping closed subscriber");
            false
        }
    });
    delivered
}
