#![forbid(unsafe_code)]

pub mod model;
pub mod storage;

pub use model::{Priority, Task, TaskRecord, parse_due_ms};
pub use storage::TaskSource;
