//! Apply-method resolver: maps payload types to the functions that fold them
//! into state.
//!
//! Each state type declares what it can fold by implementing [`Apply<E>`] per
//! event type and [`Hydrate<S>`] per snapshot type, then lists those types
//! once in an [`ApplyMethods`] table. The table is built once per state type
//! and shared by every host of that type.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::error::ApplyError;
use crate::event::{AggregateEvent, AnyEvent};
use crate::snapshot::{AggregateSnapshot, AnySnapshot};

/// Fold one event type into the implementing state.
pub trait Apply<E: AggregateEvent> {
    /// Mutate the state to reflect `event`. Must be deterministic.
    fn apply(&mut self, event: &E);
}

/// Restore the implementing state from one snapshot type.
pub trait Hydrate<S: AggregateSnapshot> {
    /// Replace the state with what `snapshot` captured.
    fn hydrate(&mut self, snapshot: &S);
}

type ApplyFn<S> = fn(&mut S, &dyn AnyEvent);
type HydrateFn<S> = fn(&mut S, &dyn AnySnapshot);

/// `TypeId`-keyed fold and hydrate functions for state type `S`.
///
/// # Examples
///
/// ```
/// use aggregate_host::{AggregateEvent, Apply, ApplyMethods};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Incremented;
/// impl AggregateEvent for Incremented {}
///
/// #[derive(Default)]
/// struct Counter(u64);
/// impl Apply<Incremented> for Counter {
///     fn apply(&mut self, _: &Incremented) {
///         self.0 += 1;
///     }
/// }
///
/// let methods = ApplyMethods::<Counter>::new().event::<Incremented>();
/// let mut counter = Counter::default();
/// methods.apply_event(&mut counter, &Incremented).unwrap();
/// assert_eq!(counter.0, 1);
/// ```
pub struct ApplyMethods<S> {
    apply: HashMap<TypeId, ApplyFn<S>>,
    hydrate: HashMap<TypeId, HydrateFn<S>>,
}

impl<S: 'static> ApplyMethods<S> {
    /// An empty table. A state with no apply methods is stateless.
    pub fn new() -> Self {
        Self {
            apply: HashMap::new(),
            hydrate: HashMap::new(),
        }
    }

    /// Register the fold function for event type `E`.
    pub fn event<E>(mut self) -> Self
    where
        E: AggregateEvent,
        S: Apply<E>,
    {
        self.apply.insert(TypeId::of::<E>(), apply_erased::<S, E>);
        self
    }

    /// Register the hydrate function for snapshot type `Sn`.
    pub fn snapshot<Sn>(mut self) -> Self
    where
        Sn: AggregateSnapshot,
        S: Hydrate<Sn>,
    {
        self.hydrate.insert(TypeId::of::<Sn>(), hydrate_erased::<S, Sn>);
        self
    }

    /// Whether a fold function is registered for `event_type`.
    pub fn handles_event(&self, event_type: TypeId) -> bool {
        self.apply.contains_key(&event_type)
    }

    /// Fold `event` into `state`.
    ///
    /// # Errors
    ///
    /// [`ApplyError::MissingApplyMethod`] if the payload's exact type has no
    /// registered fold function.
    pub fn apply_event(&self, state: &mut S, event: &dyn AnyEvent) -> Result<(), ApplyError> {
        let apply = self
            .apply
            .get(&event.payload_type())
            .ok_or_else(|| ApplyError::MissingApplyMethod {
                state: std::any::type_name::<S>(),
                event: event.type_name(),
            })?;
        apply(state, event);
        Ok(())
    }

    /// Hydrate `state` from `snapshot`.
    ///
    /// # Errors
    ///
    /// [`ApplyError::MissingHydrateMethod`] if the payload's exact type has
    /// no registered hydrate function.
    pub fn hydrate_snapshot(
        &self,
        state: &mut S,
        snapshot: &dyn AnySnapshot,
    ) -> Result<(), ApplyError> {
        let hydrate = self
            .hydrate
            .get(&snapshot.payload_type())
            .ok_or_else(|| ApplyError::MissingHydrateMethod {
                state: std::any::type_name::<S>(),
                snapshot: snapshot.type_name(),
            })?;
        hydrate(state, snapshot);
        Ok(())
    }
}

impl<S: 'static> Default for ApplyMethods<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for ApplyMethods<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyMethods")
            .field("state", &std::any::type_name::<S>())
            .field("events", &self.apply.len())
            .field("snapshots", &self.hydrate.len())
            .finish()
    }
}

fn apply_erased<S: Apply<E>, E: AggregateEvent>(state: &mut S, event: &dyn AnyEvent) {
    // Keyed by TypeId::of::<E>(), so the downcast always succeeds.
    if let Some(event) = event.downcast_ref::<E>() {
        state.apply(event);
    }
}

fn hydrate_erased<S: Hydrate<Sn>, Sn: AggregateSnapshot>(state: &mut S, snapshot: &dyn AnySnapshot) {
    if let Some(snapshot) = snapshot.downcast_ref::<Sn>() {
        state.hydrate(snapshot);
    }
}
