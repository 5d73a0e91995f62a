//! Identity for persisted state.

/// Anything a store keeps under a stable identifier (notification records,
/// scheduled task instances).
///
/// The identifier never changes over the lifetime of the value, even when every
/// other field does; stores key on it and nothing else.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn id(&self) -> &Self::Id;
}
