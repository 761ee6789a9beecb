//! Event bus: schema, content-filter patterns and the router.

pub mod pattern;
pub mod router;
pub mod types;

pub use pattern::EventPattern;
pub use router::{EventRouter, MAX_EVENT_SIZE, PutEventResult, RuleInfo};
pub use types::{
    DetailType, EmailParsedDetail, EmailReceivedDetail, EmailRef, EventEnvelope, MatchTask,
    ParseTask, PutEventEntry, SOURCE, SupplierMatchedDetail, TaskFailedDetail,
};
