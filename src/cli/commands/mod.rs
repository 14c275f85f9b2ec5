//! CLI command implementations

pub mod du;
pub mod gc;
pub mod info;
pub mod lease;

pub use du::execute as du;
pub use gc::execute as gc;
pub use info::execute as info;
pub use lease::execute as lease;
