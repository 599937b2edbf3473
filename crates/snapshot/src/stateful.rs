//! Application state capture
//!
//! Anything that wants to be included in a snapshot implements
//! [`Stateful`]: it hands out its state as a [`StateDict`] at capture time
//! and absorbs one back at restore time.

use snapshot_core::{Error, Result, StateDict};
use std::collections::BTreeMap;

/// A component whose state is captured and restored by snapshots.
pub trait Stateful {
    /// Capture the component's current state.
    fn state_dict(&self) -> Result<StateDict>;

    /// Replace the component's state with a previously captured one.
    fn load_state_dict(&mut self, state_dict: StateDict) -> Result<()>;

    /// Whether this component carries random number generator state.
    ///
    /// RNG state is special-cased during capture: it is saved first and
    /// reloaded afterwards, so taking a snapshot leaves the RNG stream
    /// exactly where it would have been without the capture.
    fn is_rng_state(&self) -> bool {
        false
    }
}

/// The components participating in a snapshot, keyed by logical name.
pub type AppState<'a> = BTreeMap<String, &'a mut dyn Stateful>;

/// Reject app states whose keys cannot form valid manifest paths.
pub fn validate_app_state(app_state: &AppState<'_>) -> Result<()> {
    let mut rng_keys = Vec::new();
    for (key, stateful) in app_state.iter() {
        if key.is_empty() {
            return Err(Error::Validation {
                message: "app state keys must be non-empty".to_string(),
            });
        }
        if key.contains('/') {
            return Err(Error::Validation {
                message: format!("app state key {key:?} must not contain '/'"),
            });
        }
        // Dot-prefixed names are reserved for snapshot-internal objects
        if key.starts_with('.') {
            return Err(Error::Validation {
                message: format!("app state key {key:?} must not start with '.'"),
            });
        }
        if stateful.is_rng_state() {
            rng_keys.push(key.clone());
        }
    }
    if rng_keys.len() > 1 {
        return Err(Error::MultipleRngStates { keys: rng_keys });
    }
    Ok(())
}

/// The key of the RNG-state component, if the app state has one.
pub fn rng_state_key(app_state: &AppState<'_>) -> Option<String> {
    app_state
        .iter()
        .find(|(_, stateful)| stateful.is_rng_state())
        .map(|(key, _)| key.clone())
}
