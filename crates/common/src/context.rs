//! Per-controller session context
//!
//! One [`RunContext`] is created per opened controller and cloned into every
//! component that needs the arbiter or the run state.

use crate::arbiter::ResourceArbiter;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Lifecycle of a data-taking run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Inactive,
    Starting,
    Active,
    Stopping,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Shared handle on a controller's arbiter and run state
pub struct RunContext<T> {
    arbiter: Arc<ResourceArbiter<T>>,
    state: Arc<Mutex<RunState>>,
}

impl<T> Clone for RunContext<T> {
    fn clone(&self) -> Self {
        Self {
            arbiter: Arc::clone(&self.arbiter),
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> RunContext<T> {
    pub fn new(transport: T) -> Self {
        Self {
            arbiter: Arc::new(ResourceArbiter::new(transport)),
            state: Arc::new(Mutex::new(RunState::Inactive)),
        }
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter<T>> {
        &self.arbiter
    }

    pub fn run_state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_run_state(&self, next: RunState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            info!("Run state {} -> {}", *state, next);
            *state = next;
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.run_state(), RunState::Starting | RunState::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let context = RunContext::new(());
        let other = context.clone();
        assert_eq!(context.run_state(), RunState::Inactive);

        other.set_run_state(RunState::Active);
        assert!(context.is_running());
        assert!(Arc::ptr_eq(context.arbiter(), other.arbiter()));
    }
}
