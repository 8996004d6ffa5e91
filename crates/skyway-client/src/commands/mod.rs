//! Command handlers run inside the client task.
//!
//! Each sub-module adds the handlers of one domain to [`Bridge`] as a
//! separate `impl` block.
//!
//! [`Bridge`]: crate::bridge::Bridge

pub mod files;
pub mod media;
pub mod messaging;
pub mod session;
