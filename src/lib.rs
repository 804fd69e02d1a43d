#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod alarm;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod notify;
pub mod output;
pub mod scheduler;
pub mod settings;
pub mod task;

pub use error::DuebellError;
pub use scheduler::{Collaborators, Notification, NotificationScheduler, SchedulerPolicy};
