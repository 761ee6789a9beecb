//! Pipeline handlers.
//!
//! Ingestion is driven by object notifications; every other handler is a
//! `TaskHandler` run by a queue consumer.

pub mod consumer;
pub mod diagnostics;
pub mod finalizer;
pub mod ingestion;
pub mod matching;
pub mod parsing;

pub use consumer::{TaskHandler, spawn_consumer};
pub use diagnostics::{DiagnosticsHandler, DiagnosticsLog};
pub use finalizer::ResultFinalizer;
pub use ingestion::{IngestionHandler, spawn_ingestion};
pub use matching::MatchingHandler;
pub use parsing::{ParseState, ParsingHandler};
