//! Socket abstraction over the supported transports.
mod socket;

pub use socket::{Io, Socket};
