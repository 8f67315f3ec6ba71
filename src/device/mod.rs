//! Device layer built on the response correlator.

pub mod leica;
pub mod state_stack;

pub use leica::{LeicaDevice, LeicaResponse};
pub use state_stack::{StateGuard, StateStack, StatefulDevice};
