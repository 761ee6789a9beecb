//! Work queues, dead-letter handling and alarms.

pub mod alarm;
pub mod message;
pub mod work_queue;

pub use alarm::{Alarm, AlarmLog};
pub use message::{Delivery, QueueMessage, QueueStats};
pub use work_queue::WorkQueue;
