//! Core types shared across the engine

pub mod cancel;
pub mod clock;
pub mod event;

pub use cancel::CancelFlag;
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use event::{Event, EventField, Severity};
