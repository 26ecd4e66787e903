//! Job execution pipeline.
//!
//! Template loading, workflow compilation, source-image staging,
//! completion detection, result extraction and the orchestrator that ties
//! them together per job. The engine, the job queue and artifact delivery
//! are reached through the [`engine::EngineClient`], [`queue::JobQueue`]
//! and [`delivery::Delivery`] traits.

pub mod compiler;
pub mod delivery;
pub mod detector;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod meta;
pub mod orchestrator;
pub mod queue;
pub mod staging;
pub mod templates;
