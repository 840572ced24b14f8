use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Local};
use runr_domain::{exit, Address, CleanupSlot, OutputMode, APP_NAME};

use crate::audit;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Installs SIGINT/SIGTERM handlers that only set a flag. The run
/// loop polls [`interrupted`] between phases so teardown happens on
/// the main thread.
#[cfg(unix)]
pub fn install_signal_handlers() {
    unsafe extern "C" fn handler(_signal: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        let handler_ptr = handler as *const () as libc::sighandler_t;
        libc::signal(libc::SIGINT, handler_ptr);
        libc::signal(libc::SIGTERM, handler_ptr);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_interrupted() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Checked after every child process exits. When a signal arrived the
/// parked cleanup fires and the interrupted record is written; the
/// caller then exits with the interrupt code.
pub fn interrupt_abort(ctx: &RunContext, address: &Address, task: &str) -> bool {
    if !interrupted() {
        return false;
    }
    ctx.cleanup.fire();
    let record = audit::interrupted_record(ctx, address, task);
    if let Err(err) = audit::append(&ctx.log_path(), &record) {
        eprintln!("{APP_NAME}: {err}");
    }
    true
}

/// Ctrl-C at an interactive prompt surfaces as a read error, so the
/// signal flag decides between the interrupt code and a terminal
/// failure.
pub fn prompt_failure_code() -> i32 {
    if interrupted() {
        exit::INTERRUPTED
    } else {
        exit::OS_ERR
    }
}

/// State shared across one invocation: where the tree lives, the run
/// identity, timing, and the pending-cleanup slot for remote scratch
/// files.
pub struct RunContext {
    pub root: PathBuf,
    pub run_id: String,
    pub start: Instant,
    pub started_at: DateTime<Local>,
    pub mode: OutputMode,
    pub cleanup: CleanupSlot,
}

impl RunContext {
    pub fn new(root: PathBuf, mode: OutputMode) -> Self {
        RunContext {
            root,
            run_id: new_run_id(),
            start: Instant::now(),
            started_at: Local::now(),
            mode,
            cleanup: CleanupSlot::new(),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(audit::LOG_FILE)
    }

    pub fn elapsed_display(&self) -> String {
        format!("{:.3}s", self.start.elapsed().as_secs_f64())
    }

    pub fn started_at_display(&self) -> String {
        self.started_at.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Scratch file names on remote hosts embed this id, so it must be
/// filename-safe and unique enough to avoid collisions between
/// concurrent runs against the same target.
fn new_run_id() -> String {
    format!("{:016X}", rand::random::<u64>())
}

pub fn default_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

impl RunContext {
    /// Test constructor with a fixed id so command shapes are
    /// assertable.
    #[cfg(test)]
    pub(crate) fn fixed(root: &std::path::Path, run_id: &str) -> Self {
        RunContext {
            root: root.to_path_buf(),
            run_id: run_id.to_string(),
            start: Instant::now(),
            started_at: Local::now(),
            mode: OutputMode::Quiet,
            cleanup: CleanupSlot::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn run_ids_are_unique_and_filename_safe() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn log_path_is_under_root() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = RunContext::new(dir.path().to_path_buf(), OutputMode::Quiet);
        assert_eq!(ctx.log_path(), dir.path().join("runr.json"));
    }

    fn address() -> Address {
        Address {
            target: "local".to_string(),
            namespace: "ns".to_string(),
            script: "job".to_string(),
            trailing_args: Vec::new(),
        }
    }

    #[test]
    fn interrupt_flag_round_trip() {
        let _guard = crate::test_support::env_lock();
        reset_interrupted();
        assert!(!interrupted());
        INTERRUPTED.store(true, Ordering::SeqCst);
        assert!(interrupted());
        reset_interrupted();
    }

    #[test]
    fn interrupt_abort_fires_cleanup_and_writes_record() {
        let _guard = crate::test_support::env_lock();
        let dir = TempDir::new().expect("temp dir");
        let ctx = RunContext::fixed(dir.path(), "id");
        ctx.cleanup.replace(|| {});

        reset_interrupted();
        assert!(!interrupt_abort(&ctx, &address(), "unlabeled"));
        assert!(ctx.cleanup.is_armed());

        INTERRUPTED.store(true, Ordering::SeqCst);
        assert!(interrupt_abort(&ctx, &address(), "unlabeled"));
        assert!(!ctx.cleanup.is_armed());
        reset_interrupted();

        let records = audit::load_records(&ctx.log_path()).expect("load");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].msg, "interrupted");
    }

    #[test]
    fn prompt_failure_maps_to_interrupt_code_when_flagged() {
        let _guard = crate::test_support::env_lock();
        reset_interrupted();
        assert_eq!(prompt_failure_code(), exit::OS_ERR);
        INTERRUPTED.store(true, Ordering::SeqCst);
        assert_eq!(prompt_failure_code(), exit::INTERRUPTED);
        reset_interrupted();
    }
}
