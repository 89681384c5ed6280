//! Zone definitions, the authoritative zone store, and its persistence hooks.

pub mod model;
pub mod persist;
pub mod store;
