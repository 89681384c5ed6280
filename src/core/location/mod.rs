//! Position ingestion: sample types, platform sources, the sampling policy
//! and the task that drives it.

pub mod controller;
pub mod model;
pub mod service;
pub mod source;
