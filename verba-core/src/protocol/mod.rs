//! Wire protocol types and the serialized response channel.
//!
//! One JSON object per line in each direction: requests arrive on stdin,
//! progress updates and exactly one terminal response per request leave on
//! stdout. Stderr carries diagnostics only and is never part of the
//! protocol.

pub mod channel;
pub mod messages;
