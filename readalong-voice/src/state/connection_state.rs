use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::error::{StateError, StateResult};

/// Maximum number of entries kept in the transition history ring
pub const MAX_STATE_HISTORY: usize = 100;

/// Lifecycle state of a realtime voice connection
///
/// ```text
/// disconnected ──► connecting ──► transport_open ──► session_created ──► ready
///      ▲               │                │                   │             │
///      │               ▼                ▼                   ▼             ▼
///      └──────────── error ◄──────────────────────────────────────── reconnecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, no session
    #[default]
    Disconnected,

    /// Credential fetched, transport being opened
    Connecting,

    /// Socket or peer data channel is open
    TransportOpen,

    /// Provider acknowledged the session
    SessionCreated,

    /// Session configured; audio and text may flow
    Ready,

    /// A ready session dropped and is being re-established
    Reconnecting,

    /// Unrecoverable failure; needs an explicit connect or disconnect
    Error,
}

impl ConnectionState {
    /// Every state, in declaration order
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::TransportOpen,
        ConnectionState::SessionCreated,
        ConnectionState::Ready,
        ConnectionState::Reconnecting,
        ConnectionState::Error,
    ];

    /// Wire/log name of the state
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::TransportOpen => "transport_open",
            Self::SessionCreated => "session_created",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// Check the declared transition table
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, TransportOpen | Error | Disconnected)
                | (TransportOpen, SessionCreated | Error | Disconnected)
                | (SessionCreated, Ready | Error | Disconnected)
                | (Ready, Error | Disconnected | Reconnecting)
                | (Reconnecting, Connecting | Error | Disconnected)
                | (Error, Disconnected | Connecting)
        )
    }

    /// Only `ready` counts as connected
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// States that sit between a connect request and `ready`
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::TransportOpen | Self::SessionCreated | Self::Reconnecting
        )
    }

    /// States from which a fresh `connect()` may start
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ConnectionState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionState::ALL
            .into_iter()
            .find(|state| state.name() == s)
            .ok_or_else(|| StateError::UnknownState(s.to_string()))
    }
}

/// One entry of the transition history
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// State that was entered
    pub state: ConnectionState,
    /// Monotonic time of entry (used for duration queries)
    pub entered_at: Instant,
    /// Wall-clock time of entry (used for diagnostics)
    pub timestamp: DateTime<Utc>,
}

impl StateRecord {
    fn now(state: ConnectionState) -> Self {
        Self {
            state,
            entered_at: Instant::now(),
            timestamp: Utc::now(),
        }
    }
}

/// Handle returned by [`ConnectionStateMachine::on_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Raw numeric id
    pub fn value(&self) -> u64 {
        self.0
    }
}

type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    history: VecDeque<StateRecord>,
    listeners: HashMap<ConnectionState, Vec<(u64, StateCallback)>>,
    next_listener_id: u64,
}

/// Finite-state machine governing a voice connection's lifecycle
///
/// Reads of the current state are lock-free. Transitions are serialized by
/// an internal lock; listeners registered with [`on_state`](Self::on_state)
/// run synchronously after the new state is visible and before
/// [`transition`](Self::transition) returns.
///
/// # Examples
///
/// ```
/// use readalong_voice_lib::state::{ConnectionState, ConnectionStateMachine};
///
/// let machine = ConnectionStateMachine::new();
/// assert!(!machine.transition(ConnectionState::Ready));
/// assert!(machine.transition(ConnectionState::Connecting));
/// assert_eq!(machine.state(), ConnectionState::Connecting);
/// ```
pub struct ConnectionStateMachine {
    current: ArcSwap<StateRecord>,
    inner: Mutex<Inner>,
    watch_tx: watch::Sender<ConnectionState>,
}

impl ConnectionStateMachine {
    /// Create a machine in `disconnected`
    pub fn new() -> Self {
        let initial = StateRecord::now(ConnectionState::Disconnected);
        let mut history = VecDeque::with_capacity(MAX_STATE_HISTORY);
        history.push_back(initial.clone());
        let (watch_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            current: ArcSwap::new(Arc::new(initial)),
            inner: Mutex::new(Inner {
                history,
                listeners: HashMap::new(),
                next_listener_id: 1,
            }),
            watch_tx,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.current.load().state
    }

    /// Time spent in the current state
    pub fn state_duration(&self) -> Duration {
        self.current.load().entered_at.elapsed()
    }

    /// `true` only in `ready`
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Messages may be sent only in `ready`
    pub fn can_send_messages(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Move to `to` if the edge is declared
    ///
    /// Returns `false` and leaves the state untouched on an undeclared edge.
    pub fn transition(&self, to: ConnectionState) -> bool {
        self.try_transition(to).is_ok()
    }

    /// Same as [`transition`](Self::transition), reporting why a move was rejected
    pub fn try_transition(&self, to: ConnectionState) -> StateResult<()> {
        let callbacks = {
            let mut inner = self.lock();
            let from = self.current.load().state;

            if !from.can_transition_to(to) {
                tracing::warn!(from = %from, to = %to, "Rejected undeclared state transition");
                return Err(StateError::InvalidTransition { from, to });
            }

            let record = StateRecord::now(to);
            self.current.store(Arc::new(record.clone()));

            if inner.history.len() >= MAX_STATE_HISTORY {
                inner.history.pop_front();
            }
            inner.history.push_back(record);

            self.watch_tx.send_replace(to);
            tracing::debug!(from = %from, to = %to, "Connection state changed");

            inner
                .listeners
                .get(&to)
                .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>())
                .unwrap_or_default()
        };

        for callback in callbacks {
            callback(to);
        }

        Ok(())
    }

    /// Register a callback invoked synchronously whenever `state` is entered
    pub fn on_state<F>(&self, state: ConnectionState, callback: F) -> ListenerId
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner
            .listeners
            .entry(state)
            .or_default()
            .push((id, Arc::new(callback)));
        ListenerId(id)
    }

    /// Remove a callback registered with [`on_state`](Self::on_state)
    pub fn remove_listener(&self, id: ListenerId) -> StateResult<()> {
        let mut inner = self.lock();
        for entries in inner.listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|(entry_id, _)| *entry_id == id.0) {
                entries.remove(pos);
                return Ok(());
            }
        }
        Err(StateError::ListenerNotFound(id.0))
    }

    /// Number of registered state callbacks
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.values().map(Vec::len).sum()
    }

    /// Watch channel that always holds the latest state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// Snapshot of the transition history, oldest first
    pub fn history(&self) -> Vec<StateRecord> {
        self.lock().history.iter().cloned().collect()
    }

    /// Total time spent in `state` across the retained history
    pub fn time_in_state(&self, state: ConnectionState) -> Duration {
        let inner = self.lock();
        let now = Instant::now();
        let mut total = Duration::ZERO;

        let mut iter = inner.history.iter().peekable();
        while let Some(record) = iter.next() {
            if record.state != state {
                continue;
            }
            let end = iter.peek().map(|next| next.entered_at).unwrap_or(now);
            total += end.saturating_duration_since(record.entered_at);
        }
        total
    }

    /// Return to `disconnected` and clear the history
    ///
    /// Listeners stay registered and are not invoked.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let record = StateRecord::now(ConnectionState::Disconnected);
        inner.history.clear();
        inner.history.push_back(record.clone());
        self.current.store(Arc::new(record));
        self.watch_tx.send_replace(ConnectionState::Disconnected);
        tracing::debug!("Connection state machine reset");
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn walk_to_ready(machine: &ConnectionStateMachine) {
        for state in [
            ConnectionState::Connecting,
            ConnectionState::TransportOpen,
            ConnectionState::SessionCreated,
            ConnectionState::Ready,
        ] {
            assert!(machine.transition(state));
        }
    }

    #[test]
    fn test_initial_state() {
        let machine = ConnectionStateMachine::new();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(!machine.is_connected());
        assert!(!machine.can_send_messages());
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in ConnectionState::ALL {
            assert_eq!(state.name().parse::<ConnectionState>().unwrap(), state);
        }
        assert!(matches!(
            "open".parse::<ConnectionState>(),
            Err(StateError::UnknownState(_))
        ));
    }

    #[test]
    fn test_transition_table_edges() {
        use ConnectionState::*;

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Disconnected.can_transition_to(Error));
        assert!(Ready.can_transition_to(Reconnecting));
        assert!(!Connecting.can_transition_to(Reconnecting));
        assert!(Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Ready));
        assert!(!Reconnecting.can_transition_to(Ready));

        for state in ConnectionState::ALL {
            assert!(!state.can_transition_to(state), "{state} must not self-loop");
        }
    }

    #[test]
    fn test_rejected_transition_leaves_state() {
        let machine = ConnectionStateMachine::new();

        let result = machine.try_transition(ConnectionState::Ready);
        assert_eq!(
            result,
            Err(StateError::InvalidTransition {
                from: ConnectionState::Disconnected,
                to: ConnectionState::Ready,
            })
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.history().len(), 1);
    }

    #[test]
    fn test_ready_flags() {
        let machine = ConnectionStateMachine::new();
        walk_to_ready(&machine);

        assert!(machine.is_connected());
        assert!(machine.can_send_messages());
        assert_eq!(machine.history().len(), 5);
    }

    #[test]
    fn test_listener_runs_only_on_success() {
        let machine = ConnectionStateMachine::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        machine.on_state(ConnectionState::Connecting, move |state| {
            assert_eq!(state, ConnectionState::Connecting);
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!machine.transition(ConnectionState::TransportOpen));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(machine.transition(ConnectionState::Connecting));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_may_transition_again() {
        let machine = Arc::new(ConnectionStateMachine::new());
        let weak = Arc::downgrade(&machine);

        machine.on_state(ConnectionState::Error, move |_| {
            if let Some(machine) = weak.upgrade() {
                machine.transition(ConnectionState::Disconnected);
            }
        });

        machine.transition(ConnectionState::Connecting);
        machine.transition(ConnectionState::Error);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_remove_listener() {
        let machine = ConnectionStateMachine::new();
        let id = machine.on_state(ConnectionState::Ready, |_| {});
        assert_eq!(machine.listener_count(), 1);

        machine.remove_listener(id).unwrap();
        assert_eq!(machine.listener_count(), 0);
        assert_eq!(
            machine.remove_listener(id),
            Err(StateError::ListenerNotFound(id.value()))
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let machine = ConnectionStateMachine::new();
        for _ in 0..80 {
            machine.transition(ConnectionState::Connecting);
            machine.transition(ConnectionState::Disconnected);
        }
        assert_eq!(machine.history().len(), MAX_STATE_HISTORY);
        assert_eq!(
            machine.history().last().map(|r| r.state),
            Some(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_reset_clears_history() {
        let machine = ConnectionStateMachine::new();
        walk_to_ready(&machine);

        machine.reset();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(machine.history().len(), 1);
        assert!(machine.transition(ConnectionState::Connecting));
    }

    #[test]
    fn test_watch_channel_follows_transitions() {
        let machine = ConnectionStateMachine::new();
        let rx = machine.subscribe();

        machine.transition(ConnectionState::Connecting);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);

        machine.transition(ConnectionState::Ready);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn test_time_in_state_accumulates() {
        let machine = ConnectionStateMachine::new();
        machine.transition(ConnectionState::Connecting);
        std::thread::sleep(Duration::from_millis(5));
        machine.transition(ConnectionState::Disconnected);

        assert!(machine.time_in_state(ConnectionState::Connecting) >= Duration::from_millis(5));
        assert_eq!(machine.time_in_state(ConnectionState::Ready), Duration::ZERO);
    }
}
