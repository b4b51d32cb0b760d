//! Anonymizing relays.
//!
//! A coordinator only ever talks to its helpers, which download on its
//! behalf from everybody else. Both sides are [`Scheduler`]s that wrap
//! plain schedulers and route every event to the right one.
//!
//! [`Scheduler`]: crate::scheduler::Scheduler
mod coordinator;
mod helper;
mod selector;

pub use coordinator::*;
pub use helper::*;
pub use selector::*;
