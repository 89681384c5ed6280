// Zone trigger evaluation and alert fan-out.
//
// Architecture:
// - model.rs: Zone lifecycle event types
// - triggers.rs: Per-zone geometric and timing checks
// - engine.rs: Evaluator that applies checks, transitions zones and schedules timers
// - dispatch.rs: Alert channels and the dispatcher that isolates their failures

pub mod dispatch;
pub mod engine;
pub mod model;
pub mod triggers;
