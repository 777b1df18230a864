//! `steward-core`: shared building blocks for the dispatch engine.
//!
//! Identifiers, time source and the small error type used by every other
//! crate. No I/O lives here.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{EntryId, WorkerId};
