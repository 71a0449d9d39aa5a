//! Output capture for managed applications and the supervisor's own log file.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    os::fd::AsFd,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
};
use tracing::{debug, warn};

use crate::constants::{
    APPLICATION_LOG_SUFFIX, LOG_COPY_BUFFER, LOG_POLL_INTERVAL_MS, SUPERVISOR_LOG_FILE,
};

/// Returns the capture file for the application running as `pid`.
pub fn application_log_path(log_dir: &Path, pid: u32) -> PathBuf {
    log_dir.join(format!("{pid}{APPLICATION_LOG_SUFFIX}"))
}

/// Returns the daemon's own diagnostic log file.
pub fn supervisor_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(SUPERVISOR_LOG_FILE)
}

/// Opens the supervisor log for appending, creating the directory and file if needed.
pub fn open_supervisor_log(log_dir: &Path) -> io::Result<File> {
    fs::create_dir_all(log_dir)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(supervisor_log_path(log_dir))
}

/// Background copy of one application's standard output into its capture file.
///
/// The copy runs on a dedicated thread until the source reaches end-of-file or the
/// pipe is cancelled. Cancellation is cooperative: the thread polls the source with a
/// short timeout and checks a shared flag between polls, so [`LogPipe::cancel_and_join`]
/// returns promptly even when the application is silent.
///
/// Dropping a `LogPipe` cancels and joins it as well.
#[derive(Debug)]
pub struct LogPipe {
    pid: u32,
    path: PathBuf,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl LogPipe {
    /// Creates `<log_dir>/<pid>_log.txt` and starts draining `source` into it.
    ///
    /// Fails without spawning anything when the capture file cannot be created.
    pub fn spawn<R>(pid: u32, source: R, log_dir: &Path) -> io::Result<Self>
    where
        R: Read + AsFd + Send + 'static,
    {
        let path = application_log_path(log_dir, pid);
        let sink = File::create(&path)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        let handle = thread::Builder::new()
            .name(format!("carpool-log-{pid}"))
            .spawn(move || drain(pid, source, sink, &flag))?;

        debug!("Capturing stdout of PID {pid} into {:?}", path);
        Ok(Self {
            pid,
            path,
            cancel,
            handle: Some(handle),
        })
    }

    /// Path of the capture file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the copy thread has already stopped (source closed or cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals cancellation and blocks until the copy thread has exited.
    ///
    /// Returns the number of bytes written to the capture file.
    pub fn cancel_and_join(mut self) -> io::Result<u64> {
        self.finish()
    }

    fn finish(&mut self) -> io::Result<u64> {
        self.cancel.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                io::Error::other(format!("log pipe for PID {} panicked", self.pid))
            })?,
            None => Ok(0),
        }
    }
}

impl Drop for LogPipe {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Err(err) = self.finish()
        {
            warn!("Log capture for PID {} ended with error: {err}", self.pid);
        }
    }
}

fn drain<R>(pid: u32, mut source: R, mut sink: File, cancel: &AtomicBool) -> io::Result<u64>
where
    R: Read + AsFd,
{
    let mut buffer = vec![0u8; LOG_COPY_BUFFER];
    let mut copied = 0u64;

    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!("Log capture for PID {pid} cancelled after {copied} bytes");
            break;
        }

        let readable = {
            let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(LOG_POLL_INTERVAL_MS)) {
                Ok(0) | Err(Errno::EINTR) => false,
                Ok(_) => true,
                Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
            }
        };

        if !readable {
            continue;
        }

        match source.read(&mut buffer) {
            Ok(0) => {
                debug!("stdout of PID {pid} closed after {copied} bytes");
                break;
            }
            Ok(read) => {
                sink.write_all(&buffer[..read])?;
                copied += read as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    sink.flush()?;
    Ok(copied)
}
