//! Process-level helpers for the gateway binary.

mod sig_down;

pub use sig_down::SigDown;
