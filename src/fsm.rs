//! Generic finite state machine.
//!
//! A machine is described by a [`StateSet`]: the set of states, the initial
//! state and the explicit table of allowed edges. [`Fsm`] walks that table,
//! refusing any edge that is not present and recording every accepted
//! transition in its history.

use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};

/// A closed set of states together with its transition table.
pub trait StateSet: Copy + Eq + Debug + Display + Send + Sync + 'static {
    /// State every new machine starts in.
    fn initial() -> Self;

    /// States reachable from `self` in a single step.
    fn targets(self) -> &'static [Self];

    fn can_reach(self, target: Self) -> bool {
        self.targets().contains(&target)
    }

    fn is_terminal(self) -> bool {
        self.targets().is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid transition from {current} to {target}")]
pub struct FsmError {
    pub current: String,
    pub target: String,
}

/// One accepted step of a machine.
#[derive(Debug, Clone)]
pub struct Transition<S, D> {
    pub state: S,
    pub reason: String,
    pub data: Option<D>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Fsm<S: StateSet, D, C = ()> {
    history: Vec<Transition<S, D>>,
    custom: C,
}

impl<S: StateSet, D, C> Fsm<S, D, C> {
    pub fn new(custom: C) -> Self {
        let initial = Transition {
            state: S::initial(),
            reason: "initial".to_string(),
            data: None,
            at: Utc::now(),
        };
        Self {
            history: vec![initial],
            custom,
        }
    }

    pub fn current(&self) -> &Transition<S, D> {
        // history always holds at least the initial transition
        &self.history[self.history.len() - 1]
    }

    pub fn state(&self) -> S {
        self.current().state
    }

    pub fn history(&self) -> &[Transition<S, D>] {
        &self.history
    }

    pub fn custom_data(&self) -> &C {
        &self.custom
    }

    /// Move to `target` if the table has an edge from the current state.
    ///
    /// On rejection nothing changes: neither the current state nor the
    /// history.
    pub fn next(
        &mut self,
        target: S,
        reason: impl Into<String>,
        data: Option<D>,
    ) -> Result<&Transition<S, D>, FsmError> {
        let current = self.state();
        if !current.can_reach(target) {
            return Err(FsmError {
                current: current.to_string(),
                target: target.to_string(),
            });
        }
        self.history.push(Transition {
            state: target,
            reason: reason.into(),
            data,
            at: Utc::now(),
        });
        Ok(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Yellow,
        Broken,
    }

    impl Display for Light {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl StateSet for Light {
        fn initial() -> Self {
            Light::Red
        }
        fn targets(self) -> &'static [Self] {
            match self {
                Light::Red => &[Light::Green, Light::Broken],
                Light::Green => &[Light::Yellow, Light::Broken],
                Light::Yellow => &[Light::Red, Light::Broken],
                Light::Broken => &[],
            }
        }
    }

    impl Arbitrary for Light {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[Light::Red, Light::Green, Light::Yellow, Light::Broken])
                .unwrap()
        }
    }

    #[test]
    fn test_starts_in_initial_state() {
        let fsm: Fsm<Light, ()> = Fsm::new(());
        assert_eq!(fsm.state(), Light::Red);
        assert_eq!(fsm.history().len(), 1);
    }

    #[test]
    fn test_valid_transition_is_recorded() {
        let mut fsm: Fsm<Light, u32, &str> = Fsm::new("crossing-1");
        let t = fsm.next(Light::Green, "timer", Some(7)).unwrap();
        assert_eq!(t.state, Light::Green);
        assert_eq!(t.reason, "timer");
        assert_eq!(t.data, Some(7));
        assert_eq!(fsm.history().len(), 2);
        assert_eq!(*fsm.custom_data(), "crossing-1");
    }

    #[test]
    fn test_invalid_transition_is_rejected_without_side_effects() {
        let mut fsm: Fsm<Light, ()> = Fsm::new(());
        let err = fsm.next(Light::Yellow, "skip", None).unwrap_err();
        assert_eq!(err.current, "Red");
        assert_eq!(err.target, "Yellow");
        assert_eq!(fsm.state(), Light::Red);
        assert_eq!(fsm.history().len(), 1);
    }

    #[test]
    fn test_terminal_state_has_no_exit() {
        let mut fsm: Fsm<Light, ()> = Fsm::new(());
        fsm.next(Light::Broken, "hit", None).unwrap();
        assert!(fsm.state().is_terminal());
        assert!(fsm.next(Light::Red, "repair", None).is_err());
    }

    #[quickcheck]
    fn prop_current_tracks_last_accepted_target(targets: Vec<Light>) -> bool {
        let mut fsm: Fsm<Light, ()> = Fsm::new(());
        let mut expected = Light::Red;
        let mut accepted = 1;
        for target in targets {
            let before = fsm.state();
            match fsm.next(target, "prop", None) {
                Ok(_) => {
                    if !before.can_reach(target) {
                        return false;
                    }
                    expected = target;
                    accepted += 1;
                }
                Err(_) => {
                    if before.can_reach(target) || fsm.state() != before {
                        return false;
                    }
                }
            }
        }
        fsm.state() == expected && fsm.history().len() == accepted
    }
}
