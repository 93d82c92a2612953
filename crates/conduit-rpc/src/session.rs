// crates/conduit-rpc/src/session.rs
//
// Streaming session manager.
//
// Owns every in-flight streaming call, keyed by (peer, callId), and runs one
// pump task per session that pulls values from the handler's stream and
// forwards them to the peer in order.
//
// Per-session lifecycle:
//   Idle -> Active -> Completed | Errored | Cancelled
// The first terminal transition wins and decides the terminal envelope, so
// each session emits exactly one of complete / error / aborted. The entry
// stays in the table until the pump has sent that envelope. A callId whose
// entry is terminal may be started again; the new pump holds back until the
// old one has finished, so the old terminal envelope always goes out first.
//
// Locking: the outer map is only touched on attach/close; session inserts and
// removals take the lock of the owning peer's slot. A slot is marked closed
// under its own lock before its sessions are drained, so a start racing a
// close either lands before the drain or is rejected.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use conduit_core::envelope::ResponseEnvelope;
use conduit_core::error::RpcError;
use conduit_core::peer::{Peer, PeerKey};

use crate::handler::ValueStream;

/// Lifecycle states of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, pump not yet running.
    Idle,
    /// Pump is forwarding handler values.
    Active,
    /// The handler's sequence ended normally.
    Completed,
    /// The handler faulted.
    Errored,
    /// Cancelled by the caller or by peer close.
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Errored | SessionState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Idle, SessionState::Active)
                | (SessionState::Idle, SessionState::Cancelled)
                | (SessionState::Active, SessionState::Active)
                | (SessionState::Active, SessionState::Completed)
                | (SessionState::Active, SessionState::Errored)
                | (SessionState::Active, SessionState::Cancelled)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Errored => write!(f, "Errored"),
            SessionState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Composite session key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: PeerKey,
    pub call_id: String,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.call_id)
    }
}

/// A binding's handle on one connection: its key, its peer capability, and
/// whether the connection can outlive a single response.
#[derive(Clone)]
pub struct PeerHandle {
    key: PeerKey,
    peer: Arc<dyn Peer>,
    persistent: bool,
}

impl PeerHandle {
    /// A handle for a request/response exchange. Not registered with the
    /// session manager; streaming calls are refused on it.
    pub fn one_shot(peer: Arc<dyn Peer>) -> Self {
        Self {
            key: PeerKey::new(),
            peer,
            persistent: false,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn peer(&self) -> &Arc<dyn Peer> {
        &self.peer
    }

    pub fn supports_streaming(&self) -> bool {
        self.persistent
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("key", &self.key)
            .field("persistent", &self.persistent)
            .finish()
    }
}

struct SessionEntry {
    /// Distinguishes reuses of the same callId.
    generation: u64,
    cancel: CancellationToken,
    /// Fired by the pump once its terminal envelope is out and the entry is
    /// gone.
    finished: CancellationToken,
    state: SessionState,
}

impl SessionEntry {
    fn transition(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }
}

#[derive(Default)]
struct PeerSessions {
    closed: bool,
    sessions: HashMap<String, SessionEntry>,
}

type Slot = Arc<Mutex<PeerSessions>>;

fn lock(slot: &Slot) -> MutexGuard<'_, PeerSessions> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a pump loop ended, before the terminal envelope is decided.
enum PumpEnd {
    Exhausted,
    Faulted(RpcError),
    Cancelled,
    PeerGone,
}

/// Owner of the session table.
#[derive(Default)]
pub struct SessionManager {
    peers: RwLock<HashMap<PeerKey, Slot>>,
    next_generation: AtomicU64,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("peers", &self.peer_count())
            .field("sessions", &self.active_sessions())
            .finish()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &PeerKey) -> Option<Slot> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Register a persistent connection and return its handle.
    pub fn attach(&self, peer: Arc<dyn Peer>) -> PeerHandle {
        let key = PeerKey::new();
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::new(Mutex::new(PeerSessions::default())));
        tracing::debug!("Peer {} attached", key);
        PeerHandle {
            key,
            peer,
            persistent: true,
        }
    }

    /// Register a session for `call_id` on the handle's peer and spawn its
    /// pump. Fails if the peer is closed or the callId is already active. A
    /// callId whose previous session is still winding down is accepted; its
    /// events follow that session's terminal envelope.
    pub fn start(
        &self,
        handle: &PeerHandle,
        call_id: &str,
        stream: ValueStream,
        cancel: CancellationToken,
    ) -> Result<SessionKey, RpcError> {
        if !handle.persistent {
            return Err(RpcError::Transport(
                "Streaming calls need a persistent connection".to_string(),
            ));
        }
        let slot = self
            .slot(&handle.key)
            .ok_or_else(|| RpcError::Transport("Peer is closed".to_string()))?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let finished = CancellationToken::new();

        let after = {
            let mut sessions = lock(&slot);
            if sessions.closed {
                return Err(RpcError::Transport("Peer is closed".to_string()));
            }
            let after = match sessions.sessions.get(call_id) {
                Some(entry) if !entry.state.is_terminal() => {
                    return Err(RpcError::Transport(format!(
                        "callId {} is already active on this connection",
                        call_id
                    )));
                }
                Some(entry) => Some(entry.finished.clone()),
                None => None,
            };
            let mut entry = SessionEntry {
                generation,
                cancel: cancel.clone(),
                finished: finished.clone(),
                state: SessionState::Idle,
            };
            entry.transition(SessionState::Active);
            sessions.sessions.insert(call_id.to_string(), entry);
            after
        };

        let key = SessionKey {
            peer: handle.key,
            call_id: call_id.to_string(),
        };
        tracing::debug!("Session {} started", key);

        let pump = Pump {
            slot,
            key: key.clone(),
            generation,
            peer: Arc::downgrade(&handle.peer),
            cancel,
            after,
            finished,
        };
        tokio::spawn(pump.run(stream));

        Ok(key)
    }

    /// Cancel one session. Returns `false` if no such session is active.
    /// The pump emits the `aborted` envelope and then drops the entry.
    pub fn cancel(&self, peer: &PeerKey, call_id: &str) -> bool {
        let Some(slot) = self.slot(peer) else {
            return false;
        };
        let mut sessions = lock(&slot);
        match sessions.sessions.get_mut(call_id) {
            Some(entry) if !entry.state.is_terminal() => {
                entry.transition(SessionState::Cancelled);
                entry.cancel.cancel();
                tracing::debug!("Session {}/{} cancelled", peer, call_id);
                true
            }
            _ => false,
        }
    }

    /// Tear down every session of a peer and forget the peer. Returns the
    /// number of sessions torn down; closing an unknown or already-closed
    /// peer returns 0.
    pub fn close_peer(&self, key: &PeerKey) -> usize {
        let slot = self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(slot) = slot else {
            return 0;
        };

        let drained: Vec<SessionEntry> = {
            let mut sessions = lock(&slot);
            if sessions.closed {
                return 0;
            }
            sessions.closed = true;
            sessions.sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in &drained {
            entry.cancel.cancel();
        }
        let torn_down = drained.iter().filter(|e| !e.state.is_terminal()).count();
        tracing::debug!("Peer {} closed, {} session(s) torn down", key, torn_down);
        torn_down
    }

    /// Close every attached peer. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let keys: Vec<PeerKey> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.iter().map(|k| self.close_peer(k)).sum()
    }

    /// Whether `call_id` is an active session on `peer`.
    pub fn is_active(&self, peer: &PeerKey, call_id: &str) -> bool {
        self.slot(peer)
            .map(|slot| {
                lock(&slot)
                    .sessions
                    .get(call_id)
                    .is_some_and(|e| !e.state.is_terminal())
            })
            .unwrap_or(false)
    }

    /// Whether `call_id` has a table entry on `peer`, active or still
    /// sending its terminal envelope.
    pub fn in_use(&self, peer: &PeerKey, call_id: &str) -> bool {
        self.slot(peer)
            .map(|slot| lock(&slot).sessions.contains_key(call_id))
            .unwrap_or(false)
    }

    /// Number of active sessions on one peer.
    pub fn sessions_for(&self, peer: &PeerKey) -> usize {
        self.slot(peer)
            .map(|slot| count_active(&lock(&slot)))
            .unwrap_or(0)
    }

    /// Total active sessions across all peers.
    pub fn active_sessions(&self) -> usize {
        let slots: Vec<Slot> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        slots.iter().map(|s| count_active(&lock(s))).sum()
    }

    /// Number of attached peers.
    pub fn peer_count(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn count_active(sessions: &PeerSessions) -> usize {
    sessions
        .sessions
        .values()
        .filter(|e| !e.state.is_terminal())
        .count()
}

/// The per-session pump task.
struct Pump {
    slot: Slot,
    key: SessionKey,
    generation: u64,
    peer: Weak<dyn Peer>,
    cancel: CancellationToken,
    /// Finish signal of the previous session under the same callId.
    after: Option<CancellationToken>,
    finished: CancellationToken,
}

impl Pump {
    async fn run(self, mut stream: ValueStream) {
        let _finished = self.finished.clone().drop_guard();
        if let Some(previous) = &self.after {
            previous.cancelled().await;
        }

        let end = self.forward(&mut stream).await;
        // Release handler resources before the terminal envelope goes out.
        drop(stream);

        let state = self.settle(&end);
        self.cancel.cancel();

        let terminal = match (end, state) {
            (PumpEnd::PeerGone, _) => None,
            (_, SessionState::Completed) => Some(ResponseEnvelope::complete(&self.key.call_id)),
            (PumpEnd::Faulted(err), SessionState::Errored) => {
                tracing::warn!("Session {} handler fault: {}", self.key, err);
                Some(ResponseEnvelope::error(&self.key.call_id, &err))
            }
            _ => Some(ResponseEnvelope::aborted(&self.key.call_id)),
        };
        tracing::debug!("Session {} -> {}", self.key, state);

        if let (Some(envelope), Some(peer)) = (terminal, self.peer.upgrade()) {
            if let Err(e) = peer.send(envelope).await {
                tracing::debug!("Terminal envelope for {} not delivered: {}", self.key, e);
            }
        }
        self.remove_own_entry();
    }

    /// Forward events until the stream ends, faults, is cancelled, or the
    /// peer becomes unreachable. Waits for room at the peer before every
    /// pull, so a full outbound queue pauses the handler.
    async fn forward(&self, stream: &mut ValueStream) -> PumpEnd {
        loop {
            {
                let Some(peer) = self.peer.upgrade() else {
                    return PumpEnd::PeerGone;
                };
                let ready = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                    ready = peer.ready() => ready,
                };
                if let Err(e) = ready {
                    tracing::debug!("Session {} peer unreachable: {}", self.key, e);
                    return PumpEnd::PeerGone;
                }
            }

            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                item = stream.next() => item,
            };

            let value = match item {
                Some(Ok(value)) => value,
                Some(Err(err)) => return PumpEnd::Faulted(err),
                None => return PumpEnd::Exhausted,
            };

            let Some(peer) = self.peer.upgrade() else {
                return PumpEnd::PeerGone;
            };
            let envelope = ResponseEnvelope::event(&self.key.call_id, value);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                sent = peer.send(envelope) => {
                    if let Err(e) = sent {
                        tracing::debug!("Session {} peer unreachable: {}", self.key, e);
                        return PumpEnd::PeerGone;
                    }
                }
            }
        }
    }

    /// Record how the loop ended unless a cancel or peer close got there
    /// first. Returns the state the terminal envelope follows.
    fn settle(&self, end: &PumpEnd) -> SessionState {
        let mut sessions = lock(&self.slot);
        let entry = sessions
            .sessions
            .get_mut(&self.key.call_id)
            .filter(|e| e.generation == self.generation);
        let Some(entry) = entry else {
            // Drained by a peer close, or replaced after a cancel.
            return SessionState::Cancelled;
        };
        if entry.state.is_terminal() {
            return entry.state;
        }
        let next = match end {
            PumpEnd::Exhausted => SessionState::Completed,
            PumpEnd::Faulted(_) => SessionState::Errored,
            PumpEnd::Cancelled | PumpEnd::PeerGone => SessionState::Cancelled,
        };
        entry.transition(next);
        next
    }

    /// Drop this session's entry if it is still ours.
    fn remove_own_entry(&self) {
        let mut sessions = lock(&self.slot);
        if sessions
            .sessions
            .get(&self.key.call_id)
            .is_some_and(|e| e.generation == self.generation)
        {
            sessions.sessions.remove(&self.key.call_id);
        }
    }
}
