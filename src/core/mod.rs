pub mod alerts;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geo;
pub mod location;
pub mod search;
pub mod sync;
pub mod timers;
pub mod zones;
