//! Utilities for testing peers without real sockets. They are used for testing
//!  the protocol engine itself, and they are exported so applications can
//!  drive their own integration tests against an in-memory network.

pub mod transport;
