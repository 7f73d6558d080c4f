//! Infrastructure layer for the controller.
//!
//! Contains OS-facing adapters: stream transports (TCP, TLS, UNIX socket),
//! the multicast-DNS scanner, the UNIX-socket prober, and file-system
//! storage for settings.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `labhost_core`, but MUST NOT be imported by the `application` layer.

pub mod discovery;
pub mod probe;
pub mod storage;
pub mod transport;
