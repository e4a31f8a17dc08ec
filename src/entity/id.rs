//! Entity identifiers.

/// A unique identifier for a simulated entity.
///
/// Events and the scheduler refer to entities by id only; the entity
/// arena owns the entities themselves, so no component ever holds a
/// pointer back into another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityId(u64);

impl EntityId {
    /// Create an entity ID from a raw integer.
    #[inline]
    pub fn new(id: u64) -> Self {
        EntityId(id)
    }

    /// Return the underlying integer.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}
