//! The handful of genuinely fallible operations in the public API.
//!
//! Everything else follows the core's sentinel-and-panic convention:
//! `get`/`remove` return `Option`, looking up a live entity by a stale id
//! is simply `false`/`None`, and a caller that hands in the wrong
//! component type for an id has a bug that panics rather than one that
//! should be recovered from. The cases below are the exception — ones a
//! well-behaved caller can expect to hit in ordinary operation.
use std::fmt;

use crate::entity::Entity;

/// Failure modes for [`crate::world::World`] operations that resolve a
/// name or cross-check a type at a boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhiskerError {
    /// A query or lookup referenced a component name that has never been
    /// registered.
    UnknownComponentName(String),
    /// A component id was used with a type that doesn't match the column
    /// it was registered with.
    ComponentTypeMismatch {
        /// The component id the caller used.
        component: Entity,
    },
    /// A process phase name was referenced that hasn't been registered
    /// with the scheduler.
    UnknownPhase(String),
}

impl fmt::Display for WhiskerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownComponentName(name) => write!(f, "unknown component name: {name}"),
            Self::ComponentTypeMismatch { component } => {
                write!(f, "component type mismatch for {component:?}")
            }
            Self::UnknownPhase(name) => write!(f, "unknown process phase: {name}"),
        }
    }
}

impl std::error::Error for WhiskerError {}

/// Convenience alias for fallible world operations.
pub type Result<T> = std::result::Result<T, WhiskerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentStore;
    use crate::entity::EntityRegistry;
    use crate::world::World;

    struct Position(f32);
    #[derive(Debug)]
    struct Velocity(f32);

    #[test]
    fn try_component_id_does_not_create_the_name() {
        let world = World::new();
        assert_eq!(
            world.try_component_id("Position"),
            Err(WhiskerError::UnknownComponentName("Position".to_owned()))
        );
        assert!(world.entities.lookup_named("Position").is_none());
    }

    #[test]
    fn try_phase_id_rejects_an_unregistered_phase() {
        let world = World::new();
        assert_eq!(world.try_phase_id("on_update"), Err(WhiskerError::UnknownPhase("on_update".to_owned())));
    }

    #[test]
    fn try_phase_id_accepts_a_registered_phase() {
        let mut world = World::new();
        let phase = world.register_phase("on_update", 60.0, false);
        assert_eq!(world.try_phase_id("on_update"), Ok(phase));
    }

    #[test]
    fn try_get_distinguishes_type_mismatch_from_absence() {
        let entities = EntityRegistry::new();
        let mut store = ComponentStore::new();
        let position = entities.create_named("Position");
        let target = entities.create();
        store.register::<Position>(position);
        store.set(position, target, Position(1.0));

        match store.try_get::<Velocity>(position, target) {
            Err(WhiskerError::ComponentTypeMismatch { component }) => assert_eq!(component, position),
            other => panic!("expected a type mismatch, got {other:?}"),
        }

        let other_id = entities.create_named("Velocity");
        assert!(store.try_get::<Velocity>(other_id, target).unwrap().is_none());
    }
}
