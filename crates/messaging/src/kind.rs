//! Event type abstraction.

use std::fmt::Debug;
use std::hash::Hash;

/// An event-type enum shared by producers and consumers.
///
/// The outbox stores the type as its string form; registries and routers key
/// on the enum itself.
pub trait EventKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable wire name of the event type.
    fn as_str(&self) -> &'static str;

    /// Topic the event is published to.
    fn topic(&self) -> &'static str;

    /// Parses a wire name back into the enum.
    fn parse(name: &str) -> Option<Self>;
}
