//! Domain types produced and consumed by host discovery.
//!
//! - **`service`** – one multicast-DNS advertisement, joined from its
//!   pointer, service-location, text and address records.
//! - **`host`** – the aggregated view of a logical host: every bridge through
//!   which it is reachable plus any settings saved for it.

pub mod host;
pub mod service;
