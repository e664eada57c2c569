//! The session lifecycle: login, restore, refresh, expiry, and sign-out.
//!
//! One `SessionManager` owns one session at a time. Expiry timers come from
//! [`crate::monitor::SessionMonitor`]; outcomes are announced on the
//! [`crate::events::SessionEventBus`].

mod manager;
mod state;

pub use manager::SessionManager;
