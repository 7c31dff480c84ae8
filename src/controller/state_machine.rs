//! Finite state machine for the Database provisioning lifecycle
//!
//! A Database moves through
//! `(none) -> Creating -> CreatingService -> CreatingConfigMap -> Completed`
//! and may drop into `Failed` from any state before `Completed`. The
//! transition table below is the only source of truth for which moves the
//! engine may persist.

use std::fmt;

use crate::crd::DatabaseState;

/// Events that trigger state transitions in the Database lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseEvent {
    /// A Database without status was observed
    Observed,
    /// The provider returned an endpoint
    DatabaseAllocated,
    /// The endpoint Service was published
    ServicePublished,
    /// The connection ConfigMap was published
    ConfigPublished,
    /// A provisioning step failed
    StepFailed,
    /// A failed Database was edited and should be provisioned again
    Retry,
    /// An unfinished provisioning run is picked up again after a restart
    Resume,
}

impl fmt::Display for DatabaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEvent::Observed => write!(f, "Observed"),
            DatabaseEvent::DatabaseAllocated => write!(f, "DatabaseAllocated"),
            DatabaseEvent::ServicePublished => write!(f, "ServicePublished"),
            DatabaseEvent::ConfigPublished => write!(f, "ConfigPublished"),
            DatabaseEvent::StepFailed => write!(f, "StepFailed"),
            DatabaseEvent::Retry => write!(f, "Retry"),
            DatabaseEvent::Resume => write!(f, "Resume"),
        }
    }
}

/// Context information available during state transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// metadata.generation of the Database
    pub generation: Option<i64>,
    /// status.observedGeneration of the Database
    pub observed_generation: Option<i64>,
}

impl TransitionContext {
    pub fn new(generation: Option<i64>, observed_generation: Option<i64>) -> Self {
        Self {
            generation,
            observed_generation,
        }
    }

    /// Whether the spec was edited since the last terminal status write
    ///
    /// Unknown generations never count as a change.
    pub fn spec_changed(&self) -> bool {
        matches!(
            (self.generation, self.observed_generation),
            (Some(current), Some(observed)) if current != observed
        )
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source state, `None` for a Database without status
    pub from: Option<DatabaseState>,
    pub to: DatabaseState,
    pub event: DatabaseEvent,
    /// Status message recorded with the transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: Option<DatabaseState>,
        to: DatabaseState,
        event: DatabaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: Option<DatabaseState>,
        to: DatabaseState,
        event: DatabaseEvent,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: Option<DatabaseState>,
        event: DatabaseEvent,
    },
    /// Guard condition prevented the transition
    GuardFailed {
        from: Option<DatabaseState>,
        to: DatabaseState,
        event: DatabaseEvent,
        reason: String,
    },
}

/// Formal state machine for the Database lifecycle
pub struct DatabaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DatabaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        use DatabaseEvent::*;
        use DatabaseState::*;

        Self {
            transitions: vec![
                Transition::new(None, Creating, Observed, "Creating database"),
                // === Forward progress ===
                Transition::new(
                    Some(Creating),
                    CreatingService,
                    DatabaseAllocated,
                    "Creating endpoint service",
                ),
                Transition::new(
                    Some(CreatingService),
                    CreatingConfigMap,
                    ServicePublished,
                    "Creating connection config",
                ),
                Transition::new(
                    Some(CreatingConfigMap),
                    Completed,
                    ConfigPublished,
                    "Database is ready",
                ),
                // === Failures ===
                Transition::new(Some(Creating), Failed, StepFailed, "Database allocation failed"),
                Transition::new(
                    Some(CreatingService),
                    Failed,
                    StepFailed,
                    "Endpoint service creation failed",
                ),
                Transition::new(
                    Some(CreatingConfigMap),
                    Failed,
                    StepFailed,
                    "Connection config creation failed",
                ),
                // === Re-entry ===
                Transition::new(Some(Failed), Creating, Retry, "Retrying database creation"),
                Transition::new(Some(Creating), Creating, Resume, "Resuming database creation"),
                Transition::new(
                    Some(CreatingService),
                    CreatingService,
                    Resume,
                    "Resuming endpoint service creation",
                ),
                Transition::new(
                    Some(CreatingConfigMap),
                    CreatingConfigMap,
                    Resume,
                    "Resuming connection config creation",
                ),
                // Completed is terminal
            ],
        }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: Option<DatabaseState>,
        event: DatabaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event);

        match transition {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: Option<DatabaseState>, event: DatabaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    /// State reached by a forward-progress event, whatever the source
    pub fn target(&self, event: DatabaseEvent) -> Option<DatabaseState> {
        self.transitions
            .iter()
            .find(|t| t.event == event)
            .map(|t| t.to)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: Option<DatabaseState>) -> Vec<DatabaseEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match (transition.from, transition.event) {
            // A failed Database is only retried after the user edits it
            (Some(DatabaseState::Failed), DatabaseEvent::Retry) if !ctx.spec_changed() => {
                Some(format!(
                    "spec unchanged since failure (generation {:?}, observed {:?})",
                    ctx.generation, ctx.observed_generation
                ))
            }
            _ => None,
        }
    }
}

/// Position of a state along the provisioning path
///
/// `Failed` has no position; it is reachable from every earlier state.
pub fn progress_rank(state: Option<DatabaseState>) -> Option<u8> {
    match state {
        None => Some(0),
        Some(DatabaseState::Creating) => Some(1),
        Some(DatabaseState::CreatingService) => Some(2),
        Some(DatabaseState::CreatingConfigMap) => Some(3),
        Some(DatabaseState::Completed) => Some(4),
        Some(DatabaseState::Failed) => None,
    }
}
