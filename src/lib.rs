pub mod acquire;
pub mod browser;
pub mod classify;
pub mod core;
pub mod login;
pub mod oob;
pub mod session;

// --- Primary exports ---
pub use acquire::{AcquiredSession, AcquisitionFailure, SessionAcquirer};
pub use crate::core::error::{AcquisitionError, BrowserError, ChannelError, StoreError};
pub use crate::core::types;
pub use crate::core::types::*;
