//! Multicast-DNS service discovery.
//!
//! # Sub-modules
//!
//! - **`records`** – The five-table record cache (A, AAAA, PTR, SRV, TXT)
//!   with per-entry expiry, and packet parsing.  No I/O.
//!
//! - **`registry`** – Wraps the cache with debounced notifications and
//!   cancellable subscriptions.
//!
//! - **`scanner`** – Owns the multicast UDP socket, sends PTR queries and
//!   feeds received packets into the registry.  Also adapts itself to the
//!   application layer's [`ServiceBrowser`] trait.

pub mod records;
pub mod registry;
pub mod scanner;

use std::time::Duration;

use async_trait::async_trait;
use labhost_core::Service;

use crate::application::host_search::ServiceBrowser;

pub use registry::{ServiceRegistry, ServicesCallback, DEFAULT_DEBOUNCE};
pub use scanner::{ScannerConfig, ScannerError, ServiceScanner, DEFAULT_QUERY_DELAY};

#[async_trait]
impl ServiceBrowser for ServiceScanner {
    async fn browse(&self, types: Vec<String>, query_delay: Duration) -> Result<Vec<Service>, String> {
        self.get_services(&types, query_delay).await.map_err(|e| e.to_string())
    }
}
