//! Path handling: normalization, sandbox containment and resolution.

pub mod normalize;
pub mod resolve;
pub mod sandbox;

pub use normalize::{qualified_id, to_absolute, to_relative, RELATIVE_ROOT};
pub use resolve::{ResourceItem, Resolver, RootConfig};
pub use sandbox::is_contained_in;
