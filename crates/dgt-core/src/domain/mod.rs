//! Long-lived state built from decoded messages.
//!
//! Nothing in here touches bytes or transports. The [`crate::protocol`]
//! layer produces typed messages and events; these types fold them into the
//! current board position and clock state.

/// Board model, position tags and the reconstructor.
pub mod board;

/// Clock state and the one-command-at-a-time gate.
pub mod clock;
