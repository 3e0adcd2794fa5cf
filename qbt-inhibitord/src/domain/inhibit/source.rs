use super::signal::ChangeEvent;
use super::value_object::{SourceRole, StateSnapshot, StateUpdate};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A source's raw input to arbitration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Vote {
    pub should_inhibit: bool,
    pub is_override: bool,
}

/// One signal producer and the arbiter's view of it.
///
/// Every field has a single writer role: the owning collaborator writes the
/// vote, override flag and its own connectivity; the arbitration loop writes
/// the published decision. Readers may look at any field at any time.
pub struct InhibitSource {
    role: SourceRole,
    name: String,
    is_override: AtomicBool,
    should_inhibit: AtomicBool,
    shutdown: AtomicBool,
    connected: AtomicBool,
    total_sessions: AtomicUsize,
    change_event: ChangeEvent,
    published: RwLock<StateSnapshot>,
}

impl InhibitSource {
    pub fn new(role: SourceRole) -> Self {
        Self::with_name(role, role.default_label())
    }

    pub fn with_name(role: SourceRole, name: impl Into<String>) -> Self {
        Self {
            role,
            name: name.into(),
            is_override: AtomicBool::new(false),
            should_inhibit: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            total_sessions: AtomicUsize::new(0),
            change_event: ChangeEvent::new(),
            published: RwLock::new(StateSnapshot::default()),
        }
    }

    pub fn role(&self) -> SourceRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Label recorded in `inhibited_by` when this source contributes.
    pub fn label(&self) -> &str {
        &self.name
    }

    pub fn vote(&self) -> Vote {
        Vote {
            should_inhibit: self.should_inhibit(),
            is_override: self.is_override(),
        }
    }

    pub fn should_inhibit(&self) -> bool {
        self.should_inhibit.load(Ordering::Acquire)
    }

    pub fn set_should_inhibit(&self, value: bool) {
        self.should_inhibit.store(value, Ordering::Release);
    }

    pub fn is_override(&self) -> bool {
        self.is_override.load(Ordering::Acquire)
    }

    pub fn set_override(&self, value: bool) {
        self.is_override.store(value, Ordering::Release);
    }

    /// Operator command: sets vote and override flag together.
    pub fn apply_command(&self, inhibit: bool, is_override: bool) {
        self.set_should_inhibit(inhibit);
        self.set_override(is_override);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Wake anything parked on the event so it can observe the flag.
        self.change_event.set();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, value: bool) {
        self.connected.store(value, Ordering::Release);
    }

    pub fn total_sessions(&self) -> usize {
        self.total_sessions.load(Ordering::Acquire)
    }

    pub fn set_total_sessions(&self, value: usize) {
        self.total_sessions.store(value, Ordering::Release);
    }

    pub fn change_event(&self) -> &ChangeEvent {
        &self.change_event
    }

    pub fn apply(&self, update: &StateUpdate) {
        self.published.write().apply(update);
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.published.read().clone()
    }

    pub fn inhibiting(&self) -> bool {
        self.published.read().inhibiting
    }

    pub fn inhibited_by(&self) -> Vec<String> {
        self.published.read().inhibited_by.clone()
    }
}

impl fmt::Debug for InhibitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InhibitSource")
            .field("role", &self.role)
            .field("name", &self.name)
            .field("vote", &self.vote())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl fmt::Display for InhibitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            SourceRole::Media => write!(f, "{}({})", self.name, self.total_sessions()),
            _ => write!(f, "{}", self.name),
        }
    }
}
