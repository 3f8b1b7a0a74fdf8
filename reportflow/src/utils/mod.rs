//! Time and hashing helpers.

mod clock;
mod fingerprint;

pub use clock::{iso_timestamp, Clock, ManualClock, SystemClock, Timestamp};
pub use fingerprint::fingerprint;
