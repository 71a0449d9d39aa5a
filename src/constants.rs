//! Constants and configuration values for the carpool supervisor.
//!
//! This module centralizes the names, file layout and timings shared by the
//! daemon, the directory and the client so both sides agree on them.

use std::{net::Ipv4Addr, time::Duration};

// ============================================================================
// Directory and Publication
// ============================================================================

/// Name under which the control service is published in the directory.
pub const SERVICE_NAME: &str = "CarpoolSupervisor";

/// Default TCP port of the shared name directory.
pub const DEFAULT_PORT: u16 = 1099;

/// Host every carpool listener binds to. The supervisor is single-host only.
pub const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// How long the directory waits when probing an existing binding for liveness.
pub const BINDING_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

// ============================================================================
// File System Layout
// ============================================================================

/// Diagnostic log written by the daemon itself, inside the log directory.
pub const SUPERVISOR_LOG_FILE: &str = "supervisor-log.txt";

/// Suffix appended to the pid of an application to name its capture file.
pub const APPLICATION_LOG_SUFFIX: &str = "_log.txt";

/// Name of the optional settings file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "carpool.yaml";

/// Log directory relative to `$HOME` when nothing else is configured.
pub const DEFAULT_LOG_DIR: &str = ".local/share/carpool/logs";

// ============================================================================
// Timing
// ============================================================================

/// Fixed wait after spawning a daemon before the single connection retry.
///
/// This is a crude readiness wait, not a readiness probe: a daemon that needs
/// longer than this to bootstrap is reported as unreachable.
pub const DEFAULT_STARTUP_WAIT_MS: u64 = 500;

/// Interval at which a log pipe re-checks its cancellation flag while the
/// child's stdout is silent.
pub const LOG_POLL_INTERVAL_MS: u16 = 100;

/// Size of the buffer used to copy child output into its log file.
pub const LOG_COPY_BUFFER: usize = 8 * 1024;

/// Upper bound on how long the daemon waits for one request line.
pub const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
