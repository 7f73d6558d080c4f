//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML settings file (discovery timings,
//! connection timeouts and the list of saved hosts) from the platform config
//! directory and writes it back when hosts are added from the command line.
//! A missing file is not an error: the defaults are used until the first save.

pub mod config;
