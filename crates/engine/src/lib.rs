//! Manta engine: owns the watches, the shared work queue and the deletion
//! tombstones, and drives the single worker that dispatches events to the
//! handler pipeline.

#![forbid(unsafe_code)]

pub mod engine;
pub mod handler;
pub mod reaper;

pub use engine::{CacheView, Engine, EngineOptions, Handler, LogHandler};
pub use handler::{HandlerPipeline, PipelineConfig};
