//! Application layer use cases for the controller.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (plain data types in `labhost_core`) and the infrastructure (sockets,
//! multicast, file system).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "find every
//!   host I can reach right now").
//! - **Depend on abstractions** (traits) rather than concrete implementations,
//!   so the infrastructure can be swapped without changing this code.
//! - **Contain no OS calls and no file system access**.  Byte streams arrive
//!   through the [`protocol_client::MessageChannel`] trait.
//!
//! # Sub-modules
//!
//! - **`protocol_client`** – Drives one connection to a host: the
//!   `initialize`/`state` handshake, request/response correlation by id, the
//!   running loop that applies state updates, and shutdown.
//!
//! - **`host_search`** – Merges saved hosts, multicast-DNS advertisements and
//!   live UNIX sockets into one table keyed by host identifier.

pub mod host_search;
pub mod protocol_client;
