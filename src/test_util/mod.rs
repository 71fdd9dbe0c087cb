//! Test doubles for the transport contracts: a send transport that records what is sent, a
//!  receive source that test code fires events on, and a handler collecting received messages.

pub mod handler;
pub mod transport;
