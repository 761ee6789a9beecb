//! Email ingestion pipeline: lands raw RFQ emails, extracts what is being
//! requested and matches the request against a supplier catalog.

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod handlers;
pub mod llm;
pub mod logging;
pub mod matching;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod store;

pub use config::PipelineConfig;
pub use error::{Error, HandlerError};
pub use pipeline::{Components, Pipeline};
