//! Message categories for the duplicate filter.

/// Coarse grouping of message types, by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageCategory {
    /// Position and movement updates.
    Position,
    /// Chunk and block updates.
    Chunk,
    /// Entity updates.
    Entity,
    /// Everything else.
    Other,
}

impl MessageCategory {
    /// Classifies a type name by substring, first match wins.
    #[must_use]
    pub fn classify(type_name: &str) -> Self {
        if type_name.contains("Position") || type_name.contains("Move") {
            Self::Position
        } else if type_name.contains("Chunk") || type_name.contains("Block") {
            Self::Chunk
        } else if type_name.contains("Entity") {
            Self::Entity
        } else {
            Self::Other
        }
    }
}

/// Last path segment of a type name (`a::b::Foo` -> `Foo`).
#[must_use]
pub fn short_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}
