//! Identity of the variables appearing in expressions.

use core::fmt::Debug;

/// Opaque description of a [`Variable`](crate::Operator::Variable) leaf.
///
/// The only thing the engine relies on is [`Metadata::id`]: it must be stable
/// and unique, since the ESHash of a variable is derived from it.  Two
/// variables with the same id are the same variable.
pub trait Metadata: Debug + Send + Sync {
    /// Stable, unique identity of the variable.
    fn id(&self) -> String;

    /// Whether the variable takes its values in the base field.
    fn is_base(&self) -> bool {
        true
    }
}

impl Metadata for String {
    fn id(&self) -> String {
        self.clone()
    }
}

impl Metadata for &'static str {
    fn id(&self) -> String {
        (*self).to_owned()
    }
}
