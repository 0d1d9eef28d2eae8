//! Sensor access consent.
//!
//! Consent is requested per pipeline start. `request_access` returns a
//! `ConsentTicket` that the requesting acquisition thread owns; the platform
//! resolves it exactly once through the paired `ConsentResolver`, from any
//! thread. Nothing about consent lives in process-wide state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Which capability is being requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConsentKind {
    Camera,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Pending,
    Allowed,
    DeniedBySystem,
    DeniedByUser,
    NotDeclared,
    PromptRequired,
}

impl ConsentState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConsentState::Pending)
    }

    pub fn is_allowed(self) -> bool {
        matches!(self, ConsentState::Allowed)
    }

    pub fn describe(self) -> &'static str {
        match self {
            ConsentState::Pending => "consent still pending",
            ConsentState::Allowed => "access granted",
            ConsentState::DeniedBySystem => "access denied by the system",
            ConsentState::DeniedByUser => "access denied by the user",
            ConsentState::NotDeclared => "capability not declared by the application",
            ConsentState::PromptRequired => "capability user prompt required",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ConsentState::Pending),
            "allowed" => Some(ConsentState::Allowed),
            "denied_by_system" => Some(ConsentState::DeniedBySystem),
            "denied_by_user" => Some(ConsentState::DeniedByUser),
            "not_declared" => Some(ConsentState::NotDeclared),
            "prompt_required" => Some(ConsentState::PromptRequired),
            _ => None,
        }
    }
}

impl fmt::Display for ConsentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug)]
struct ConsentCell {
    state: Mutex<ConsentState>,
    resolved: Condvar,
}

/// Completion object owned by the pipeline that asked for consent.
#[derive(Debug)]
pub struct ConsentTicket {
    cell: Arc<ConsentCell>,
}

/// Delivery side of a ticket. The first terminal state wins.
#[derive(Clone, Debug)]
pub struct ConsentResolver {
    cell: Arc<ConsentCell>,
}

/// Create a pending ticket and its resolver.
pub fn consent_channel() -> (ConsentTicket, ConsentResolver) {
    let cell = Arc::new(ConsentCell {
        state: Mutex::new(ConsentState::Pending),
        resolved: Condvar::new(),
    });
    (
        ConsentTicket { cell: cell.clone() },
        ConsentResolver { cell },
    )
}

impl ConsentResolver {
    /// Deliver the platform's answer. Returns false if the ticket was already
    /// resolved or `state` is not terminal.
    pub fn resolve(&self, state: ConsentState) -> bool {
        if !state.is_terminal() {
            return false;
        }
        let mut guard = self.cell.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_terminal() {
            return false;
        }
        *guard = state;
        self.cell.resolved.notify_all();
        true
    }
}

impl ConsentTicket {
    /// A ticket that is already resolved.
    pub fn resolved(state: ConsentState) -> Self {
        let (ticket, resolver) = consent_channel();
        resolver.resolve(state);
        ticket
    }

    pub fn state(&self) -> ConsentState {
        *self.cell.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a terminal state arrives or `stop` is raised.
    ///
    /// Returns `None` when interrupted by `stop` before resolution.
    pub fn await_terminal(&self, stop: &AtomicBool) -> Option<ConsentState> {
        let mut guard = self.cell.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if guard.is_terminal() {
                return Some(*guard);
            }
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            let (next, _) = self
                .cell
                .resolved
                .wait_timeout(guard, Duration::from_millis(20))
                .unwrap_or_else(|e| e.into_inner());
            guard = next;
        }
    }
}

/// Platform capability check.
pub trait ConsentProvider: Send + Sync {
    fn request_access(&self, kind: ConsentKind) -> ConsentTicket;
}

/// Resolves every request to a fixed answer after a delay, on its own thread,
/// the way a platform consent prompt calls back asynchronously.
#[derive(Clone, Debug)]
pub struct ScriptedConsent {
    outcome: ConsentState,
    delay: Duration,
}

impl ScriptedConsent {
    pub fn new(outcome: ConsentState, delay: Duration) -> Self {
        Self { outcome, delay }
    }

    pub fn allow_all() -> Self {
        Self::new(ConsentState::Allowed, Duration::ZERO)
    }
}

impl ConsentProvider for ScriptedConsent {
    fn request_access(&self, kind: ConsentKind) -> ConsentTicket {
        log::debug!("{:?} access requested, answering {}", kind, self.outcome);
        if self.delay.is_zero() {
            return ConsentTicket::resolved(self.outcome);
        }
        let (ticket, resolver) = consent_channel();
        let outcome = self.outcome;
        let delay = self.delay;
        let spawned = std::thread::Builder::new()
            .name("consent-prompt".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                resolver.resolve(outcome);
            });
        if let Err(err) = spawned {
            log::error!("consent prompt thread failed to start: {}", err);
            return ConsentTicket::resolved(ConsentState::DeniedBySystem);
        }
        ticket
    }
}
