use std::sync::{Mutex, MutexGuard};

/// A mutex-guarded state machine with atomic transitions.
///
/// The bridge uses this to track upstream child health, where a
/// transition and the action it triggers (restart, fail pending
/// requests, enter terminal state) must be decided under one lock.
///
/// # Example
///
/// ```rust
/// use silta_common::StateMachine;
///
/// #[derive(Clone, Copy, PartialEq, Debug)]
/// enum Health {
///     Ready,
///     Dead,
/// }
///
/// let machine = StateMachine::new(Health::Ready);
///
/// let must_restart = machine.transition(|state| match state {
///     Health::Ready => {
///         *state = Health::Dead;
///         true
///     }
///     Health::Dead => false,
/// });
/// assert!(must_restart);
/// assert_eq!(machine.snapshot(), Health::Dead);
/// ```
#[derive(Debug)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a machine in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Direct access to the state via a guard, for simple checks.
    ///
    /// Prefer `transition` when the read decides a state change.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap()
    }

    /// Perform an atomic transition.
    ///
    /// The closure runs with the lock held; its return value is
    /// handed back to the caller so the decision made under the lock
    /// can drive follow-up work outside it.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut *state)
    }
}

impl<S: Copy> StateMachine<S> {
    /// Copy of the current state.
    pub fn snapshot(&self) -> S {
        *self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn transitions_are_serialized() {
        let machine = Arc::new(StateMachine::new(0u32));
        let mut handles = vec![];

        for _ in 0..8 {
            let machine = machine.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    machine.transition(|state| {
                        *state += 1;
                    });
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(machine.snapshot(), 2000);
    }

    #[test]
    fn transition_returns_decision_made_under_lock() {
        #[derive(Clone, Copy, PartialEq, Debug)]
        enum Health {
            Starting,
            Ready,
        }

        let machine = StateMachine::new(Health::Starting);

        let became_ready = machine.transition(|state| match state {
            Health::Starting => {
                *state = Health::Ready;
                true
            }
            Health::Ready => false,
        });

        assert!(became_ready);
        assert_eq!(machine.snapshot(), Health::Ready);

        let became_ready = machine.transition(|state| match state {
            Health::Starting => {
                *state = Health::Ready;
                true
            }
            Health::Ready => false,
        });
        assert!(!became_ready);
    }
}
