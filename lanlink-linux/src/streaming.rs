//! Streaming ingestion: one task per session drives an HTTP response body through the
//! format adapter, mirrors text into the recovery store and forwards events in order.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use lanlink_core::{
    RecoveryError, RecoveryStore, SessionId, StoreOp, StreamError, StreamEvent, StreamKind,
    StreamSession, WireFormat,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

/// What to stream and where. `api_base` already carries the provider prefix
/// (`http://host:11434/api`, `https://api.openai.com/v1`).
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Fresh id when `None`.
    pub id: Option<SessionId>,
    pub kind: StreamKind,
    pub api_base: String,
    pub token: Option<String>,
}

/// Running sessions. Each open gets a serial so a replaced session's task cannot remove the
/// entry of the session that replaced it.
#[derive(Default)]
struct ActiveSessions {
    opened: u64,
    tokens: HashMap<SessionId, (u64, CancellationToken)>,
}

impl ActiveSessions {
    fn insert(&mut self, id: SessionId, token: CancellationToken) -> u64 {
        self.opened += 1;
        if let Some((_, previous)) = self.tokens.insert(id, (self.opened, token)) {
            previous.cancel();
        }
        self.opened
    }

    fn finish(&mut self, id: SessionId, serial: u64) {
        if self.tokens.get(&id).is_some_and(|(s, _)| *s == serial) {
            self.tokens.remove(&id);
        }
    }
}

#[derive(Clone)]
pub struct StreamingEngine {
    client: reqwest::Client,
    store: Arc<dyn RecoveryStore>,
    active: Arc<Mutex<ActiveSessions>>,
}

impl StreamingEngine {
    pub fn new(client: reqwest::Client, store: Arc<dyn RecoveryStore>) -> Self {
        Self {
            client,
            store,
            active: Arc::new(Mutex::new(ActiveSessions::default())),
        }
    }

    /// Start a session. Events arrive on the returned handle; dropping it cancels.
    /// Reusing the id of a running session cancels that session.
    pub fn open_stream(&self, request: StreamRequest) -> StreamHandle {
        let id = request.id.unwrap_or_default();
        let url = request.kind.url(&request.api_base);
        let cancel = CancellationToken::new();
        let serial = self.active.lock().insert(id, cancel.clone());
        if request.kind.requires_auth() && request.token.is_none() {
            tracing::warn!(session = %id, %url, "provider expects a bearer token; none given");
        }
        let session = StreamSession::new(id, url, request.kind.wire_format());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_session(
            Ingest {
                client: self.client.clone(),
                store: self.store.clone(),
                request,
                tx,
            },
            session,
            cancel.clone(),
            self.active.clone(),
            serial,
        ));
        StreamHandle {
            id,
            events: rx,
            cancel,
        }
    }

    /// Cancel by id. Returns false if no such session is running.
    pub fn cancel(&self, id: SessionId) -> bool {
        match self.active.lock().tokens.get(&id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Partial text of every session that never finished. Reads the store on the calling
    /// thread.
    pub fn recover_partial_responses(&self) -> Result<BTreeMap<String, String>, RecoveryError> {
        lanlink_core::recover_partial_responses(self.store.as_ref())
    }
}

/// Ordered events of one session. Ends after `Done`/`Error`, or silently once cancelled.
pub struct StreamHandle {
    id: SessionId,
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for StreamHandle {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        this.events.poll_recv(cx)
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything a session task needs besides its bookkeeping.
struct Ingest {
    client: reqwest::Client,
    store: Arc<dyn RecoveryStore>,
    request: StreamRequest,
    tx: mpsc::Sender<StreamEvent>,
}

async fn run_session(
    ingest: Ingest,
    mut session: StreamSession,
    cancel: CancellationToken,
    active: Arc<Mutex<ActiveSessions>>,
    serial: u64,
) {
    let id = session.id();
    tracing::info!(session = %id, url = %session.url(), "stream opened");
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!(session = %id, received = session.text().len(), "stream cancelled");
        }
        _ = ingest.drive(&mut session) => {
            tracing::info!(session = %id, received = session.text().len(), "stream finished");
        }
    }
    active.lock().finish(id, serial);
}

impl Ingest {
    async fn drive(&self, session: &mut StreamSession) {
        let mut req = self
            .client
            .post(session.url())
            .header(reqwest::header::ACCEPT, accept_for(&self.request))
            .json(&self.request.kind.body());
        if let Some(token) = &self.request.token {
            req = req.bearer_auth(token);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let _ = self
                    .deliver(session, StreamEvent::Error(StreamError::Transport(e.to_string())))
                    .await;
                return;
            }
        };
        let status = resp.status();
        if !status.is_success() {
            tracing::warn!(session = %session.id(), status = status.as_u16(), "stream rejected");
            let _ = self
                .deliver(session, StreamEvent::Error(StreamError::Status(status.as_u16())))
                .await;
            return;
        }

        let has_entry = self.has_entry(session).await;
        if let Some(op) = session.open(has_entry) {
            self.persist(session.id(), op).await;
        }
        let mut adapter = session.format().adapter();
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            let events = match chunk {
                Ok(bytes) => adapter.feed(&bytes),
                Err(e) => vec![StreamEvent::Error(StreamError::Transport(e.to_string()))],
            };
            for event in events {
                if !self.deliver(session, event).await {
                    return;
                }
            }
        }
        for event in adapter.finish() {
            if !self.deliver(session, event).await {
                return;
            }
        }
    }

    /// Record, persist, then forward. False once the sequence is over or nobody is listening.
    async fn deliver(&self, session: &mut StreamSession, event: StreamEvent) -> bool {
        if let Some(op) = session.record(&event) {
            self.persist(session.id(), op).await;
        }
        let terminal = event.is_terminal();
        self.tx.send(event).await.is_ok() && !terminal
    }

    /// Store writes fsync; keep them off the runtime threads.
    async fn persist(&self, id: SessionId, op: StoreOp) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || op.apply(store.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session = %id, error = %e, "recovery store write failed"),
            Err(e) => tracing::warn!(session = %id, error = %e, "recovery store write aborted"),
        }
    }

    async fn has_entry(&self, session: &StreamSession) -> bool {
        let store = self.store.clone();
        let key = session.key().to_string();
        match tokio::task::spawn_blocking(move || store.get(&key)).await {
            Ok(Ok(entry)) => entry.is_some(),
            Ok(Err(e)) => {
                tracing::warn!(session = %session.id(), error = %e, "recovery store read failed");
                false
            }
            Err(e) => {
                tracing::warn!(session = %session.id(), error = %e, "recovery store read aborted");
                false
            }
        }
    }
}

fn accept_for(request: &StreamRequest) -> &'static str {
    match request.kind.wire_format() {
        WireFormat::Ndjson => "application/x-ndjson",
        WireFormat::Sse => "text/event-stream",
    }
}
