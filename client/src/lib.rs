//! Client role of the live post protocol.
//!
//! [`fsm`] is a small generic state machine engine. [`composer`] builds the
//! post composition controller on top of it; the controller is sans-IO, so
//! hosts (the terminal client, tests, a browser binding) own the socket and
//! execute the effects it produces.

pub mod composer;
pub mod fsm;
pub mod quote;

pub use composer::{Author, Composer, Effect, PostState, StaffCredentials};
pub use fsm::{Fsm, Queue};
