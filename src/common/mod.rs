//! Shared building blocks

pub mod clock;
pub mod error;
pub mod net;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use net::Address;
