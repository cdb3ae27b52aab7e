//! Stream framing.
//!
//! Two disciplines share nothing but the shape of their API: feed raw
//! chunks in, take complete frames out. [`length`] is binary-safe and
//! self-delimiting; [`prompt`] infers the end of a turn from the remote
//! printing its prompt again.

pub mod length;
pub mod prompt;
