//! Carpool is a single-host supervisor daemon. A short-lived client asks the daemon
//! to launch, list and terminate applications; the daemon captures each
//! application's stdout into its own log file and publishes its control service in
//! a small localhost name directory so clients can find it.

/// Directory bootstrap (attach or create, then publish).
pub mod bootstrap;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Client-side discovery and daemon startup.
pub mod connector;

/// Shared names, file layout and timings.
pub mod constants;

/// Name directory used to publish the control service.
pub mod directory;

/// Error handling.
pub mod error;

/// Wire protocol and client stub for the control service.
pub mod ipc;

/// Application output capture and supervisor log files.
pub mod logs;

/// Registry of managed applications.
pub mod registry;

/// Control service operations.
pub mod service;

/// Supervisor runtime that serves the control service.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
