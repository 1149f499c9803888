//! Attendance aggregation and bulk marking.
//!
//! Everything here is stateless: callers pass in records (or a store) on
//! every call and nothing is cached between calls.

pub mod aggregate;
pub mod bulk;
pub mod error;
pub mod filter;
pub mod notify;
pub mod record;
pub mod status;

pub use bulk::AttendanceStore;
pub use error::AttendanceError;
