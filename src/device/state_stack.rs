//! Push/pop device state
//!
//! A device that implements [`StatefulDevice`] can temporarily change several
//! properties and later restore them:
//!
//! ```rust,ignore
//! {
//!     let lamp = lamp.in_state([("enabled", json!(true)), ("intensity", json!(120))])?;
//!     camera.acquire_image()?;
//! } // previous values restored here, also on early return via `?`
//! ```
//!
//! Only properties whose value actually changes are recorded, so nested
//! pushes restore exactly what they altered.

use std::ops::{Deref, DerefMut};

use serde_json::Value;
use tracing::warn;

use crate::error::{AppResult, ScopeError};

/// One saved snapshot: property names and the values to restore, in set order.
pub type StateSnapshot = Vec<(String, Value)>;

/// Stack of snapshots owned by a device.
#[derive(Debug, Default, Clone)]
pub struct StateStack {
    frames: Vec<StateSnapshot>,
}

impl StateStack {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots currently pushed.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// True when nothing is pushed.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn push(&mut self, snapshot: StateSnapshot) {
        self.frames.push(snapshot);
    }

    fn pop(&mut self) -> Option<StateSnapshot> {
        self.frames.pop()
    }
}

/// Device with named, JSON-valued properties that can be pushed and popped.
pub trait StatefulDevice {
    /// Current value of `property`.
    fn get_state(&mut self, property: &str) -> AppResult<Value>;

    /// Change `property`.
    fn set_state(&mut self, property: &str, value: Value) -> AppResult<()>;

    /// The device's snapshot stack.
    fn state_stack(&mut self) -> &mut StateStack;

    /// Ordering weight when applying pushed values; lower goes first.
    fn push_weight(&self, _property: &str) -> i32 {
        0
    }

    /// Ordering weight when restoring popped values; lower goes first.
    fn pop_weight(&self, _property: &str) -> i32 {
        0
    }

    /// Set several properties at once, saving the old values for [`pop_state`](Self::pop_state).
    ///
    /// If a set fails, the properties already changed are put back (in
    /// pop order) and nothing is pushed.
    fn push_state<I, S>(&mut self, state: I) -> AppResult<()>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
        Self: Sized,
    {
        let mut changes = StateSnapshot::new();
        let mut previous = StateSnapshot::new();
        for (property, value) in state {
            let property = property.into();
            let old = self.get_state(&property)?;
            if old != value {
                previous.push((property.clone(), old));
                changes.push((property, value));
            }
        }

        sort_by_weight(&mut changes, |p| self.push_weight(p));
        let mut applied = Vec::with_capacity(changes.len());
        for (property, value) in changes {
            if let Err(e) = self.set_state(&property, value) {
                // undo what already changed before reporting
                let mut rollback: StateSnapshot = previous
                    .into_iter()
                    .filter(|(p, _)| applied.contains(p))
                    .collect();
                sort_by_weight(&mut rollback, |p| self.pop_weight(p));
                for (property, value) in rollback {
                    if let Err(undo) = self.set_state(&property, value) {
                        warn!("Failed to roll back {property}: {undo}");
                    }
                }
                return Err(e);
            }
            applied.push(property);
        }
        self.state_stack().push(previous);
        Ok(())
    }

    /// Restore the values saved by the most recent [`push_state`](Self::push_state).
    fn pop_state(&mut self) -> AppResult<()>
    where
        Self: Sized,
    {
        let mut previous = self
            .state_stack()
            .pop()
            .ok_or_else(|| ScopeError::Configuration("pop_state without matching push_state".into()))?;
        sort_by_weight(&mut previous, |p| self.pop_weight(p));
        apply(self, previous)
    }

    /// Push `state` and return a guard that pops it when dropped.
    fn in_state<I, S>(&mut self, state: I) -> AppResult<StateGuard<'_, Self>>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
        Self: Sized,
    {
        self.push_state(state)?;
        Ok(StateGuard {
            device: self,
            restored: false,
        })
    }
}

fn sort_by_weight(snapshot: &mut StateSnapshot, weight: impl Fn(&str) -> i32) {
    // stable: equal weights keep caller order
    snapshot.sort_by_key(|(property, _)| weight(property));
}

fn apply<D: StatefulDevice>(device: &mut D, snapshot: StateSnapshot) -> AppResult<()> {
    for (property, value) in snapshot {
        device.set_state(&property, value)?;
    }
    Ok(())
}

/// Scoped state change; restores the previous values when dropped.
pub struct StateGuard<'a, D: StatefulDevice> {
    device: &'a mut D,
    restored: bool,
}

impl<D: StatefulDevice> StateGuard<'_, D> {
    /// Restore now and report any error instead of logging it on drop.
    pub fn restore(mut self) -> AppResult<()> {
        self.restored = true;
        self.device.pop_state()
    }
}

impl<D: StatefulDevice> Deref for StateGuard<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
    }
}

impl<D: StatefulDevice> DerefMut for StateGuard<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
    }
}

impl<D: StatefulDevice> Drop for StateGuard<'_, D> {
    fn drop(&mut self) {
        if !self.restored {
            if let Err(e) = self.device.pop_state() {
                warn!("Failed to restore device state: {e}");
            }
        }
    }
}
