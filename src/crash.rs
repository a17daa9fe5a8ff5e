//! Crash handling and diagnostics
//!
//! Captures the failure modes that bypass normal error handling (Rust
//! panics with backtraces, fatal Unix signals) into a dedicated crash log
//! that is flushed synchronously so it survives process death. The pipeline
//! publishes the playout situation on every engine state change, and panic
//! reports embed that last-known situation so a crash in the field can be
//! matched to what was on air when it happened.
//!
//! Renderer-level crash recovery is a separate, softer path handled by the
//! playout pipeline; this file is about the process itself going down.

use std::fs::OpenOptions;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::error;

use crate::engine::EngineSnapshot;

static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

#[cfg(unix)]
static CRASH_LOG_FD: OnceLock<std::os::unix::io::RawFd> = OnceLock::new();

/// Last-known playout situation, rendered once per state change. Read from
/// the panic hook; signal handlers stay out of it (taking a lock is not
/// async-signal-safe).
static PLAYOUT_CONTEXT: Mutex<Option<String>> = Mutex::new(None);

const CRASH_LOG_FILENAME: &str = "crash.log";

/// Install the panic hook and Unix signal handlers. Call early in main().
/// Returns the path of the crash log file.
pub fn init_crash_handler(log_dir: &Path) -> std::io::Result<PathBuf> {
    let crash_log_path = log_dir.join(CRASH_LOG_FILENAME);
    let _ = CRASH_LOG_PATH.set(crash_log_path.clone());

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log_path)?;

        // Duplicate so the descriptor outlives the File.
        let dup_fd = unsafe { libc::dup(file.as_raw_fd()) };
        if dup_fd >= 0 {
            let _ = CRASH_LOG_FD.set(dup_fd);
        }
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        record_panic(panic_info);
        default_hook(panic_info);
    }));

    #[cfg(unix)]
    unsafe {
        install_signal_handlers();
    }

    Ok(crash_log_path)
}

/// Get the crash log path
pub fn crash_log_path() -> Option<&'static PathBuf> {
    CRASH_LOG_PATH.get()
}

/// Publish the current playout situation for inclusion in crash reports.
pub fn note_playout(snapshot: &EngineSnapshot) {
    let pgm = snapshot
        .pgm_template
        .as_ref()
        .and_then(|t| t.template_id.as_deref())
        .unwrap_or("-");
    let line = format!(
        "state={} pgm={} mixing={}",
        snapshot.state.as_str(),
        pgm,
        snapshot.mixing
    );
    if let Ok(mut slot) = PLAYOUT_CONTEXT.lock() {
        *slot = Some(line);
    }
}

/// Never blocks: a panic while the publisher holds the lock falls back to
/// "unknown" instead of deadlocking the hook.
fn playout_context() -> String {
    PLAYOUT_CONTEXT
        .try_lock()
        .ok()
        .and_then(|slot| slot.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn record_panic(panic_info: &PanicHookInfo) {
    let timestamp = chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string();

    let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };

    let location = panic_info
        .location()
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "unknown location".to_string());

    let backtrace = std::backtrace::Backtrace::force_capture().to_string();
    let playout = playout_context();
    let report = compose_report(&timestamp, &location, &message, &playout, &backtrace);

    if let Some(path) = CRASH_LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.flush();
            let _ = file.sync_all();
        }
    }

    // May never reach the rolling log if we are going down hard.
    error!("PANIC at {location}: {message} (see crash.log)");
}

fn compose_report(
    timestamp: &str,
    location: &str,
    message: &str,
    playout: &str,
    backtrace: &str,
) -> String {
    let separator = "=".repeat(72);
    format!(
        "\n{separator}\n\
         PANIC at {timestamp}\n\
         Location: {location}\n\
         Message: {message}\n\
         Playout: {playout}\n\
         \n\
         Backtrace:\n\
         {backtrace}\n\
         {separator}\n"
    )
}

#[cfg(unix)]
unsafe fn install_signal_handlers() {
    use libc::{sigaction, sighandler_t, SA_RESETHAND};

    for signal in [
        libc::SIGSEGV,
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
    ] {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = signal_handler as sighandler_t;
        // Default disposition is restored so re-raising terminates properly.
        action.sa_flags = SA_RESETHAND;
        libc::sigemptyset(&mut action.sa_mask);
        sigaction(signal, &action, std::ptr::null_mut());
    }
}

/// Only async-signal-safe calls allowed in here: write() and raise(). The
/// playout context is deliberately absent, it lives behind a lock.
#[cfg(unix)]
extern "C" fn signal_handler(sig: libc::c_int) {
    let message: &[u8] = match sig {
        libc::SIGSEGV => b"\nFATAL: SIGSEGV (segmentation fault)\n",
        libc::SIGABRT => b"\nFATAL: SIGABRT (abort)\n",
        libc::SIGBUS => b"\nFATAL: SIGBUS (bus error)\n",
        libc::SIGFPE => b"\nFATAL: SIGFPE (floating point exception)\n",
        libc::SIGILL => b"\nFATAL: SIGILL (illegal instruction)\n",
        _ => b"\nFATAL: unexpected signal\n",
    };

    if let Some(&fd) = CRASH_LOG_FD.get() {
        unsafe {
            libc::write(fd, message.as_ptr() as *const libc::c_void, message.len());
            libc::fsync(fd);
        }
    }
    unsafe {
        libc::write(2, message.as_ptr() as *const libc::c_void, message.len());
        // Handler was installed with SA_RESETHAND; this terminates.
        libc::raise(sig);
    }
}
