use std::path::PathBuf;
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "runr";

/// Environment variables with this prefix are re-exported into the
/// assembled payload under the stripped name.
pub const ENV_PREFIX: &str = "RUNR__";

/// Overrides the audit task label when set.
pub const TASK_ENV: &str = "RUNR_TASK";

/// Marker written to the audit log in place of an injected value.
pub const REDACTED: &str = "<redacted>";

/// Sentinel scanned for in stdout of a successful run.
pub const CHANGED_TOKEN: &str = "__CHANGED__";

/// Sentinel scanned for in stderr of a successful run.
pub const REPAIRED_TOKEN: &str = "__REPAIRED__";

/// Process exit codes. Callers rely on these to tell failure classes
/// apart, so they are fixed.
pub mod exit {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const USAGE: i32 = 64;
    pub const NO_INPUT: i32 = 66;
    pub const OS_ERR: i32 = 71;
    pub const CANT_CREATE: i32 = 73;
    pub const NOT_EXECUTABLE: i32 = 126;
    pub const NOT_FOUND: i32 = 127;
    pub const INTERRUPTED: i32 = 130;
}

/// A resolved `target` + `namespace:script` invocation. Constructed
/// once from argv, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub target: String,
    pub namespace: String,
    pub script: String,
    pub trailing_args: Vec<String>,
}

impl Address {
    pub fn script_dir(&self) -> PathBuf {
        PathBuf::from(&self.namespace).join(&self.script)
    }

    pub fn display_name(&self) -> String {
        format!("{}:{}", self.namespace, self.script)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prelude,
    Main,
    Epilogue,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Prelude => "prelude",
            Phase::Main => "main",
            Phase::Epilogue => "epilogue",
        }
    }
}

/// How the target string classifies, decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Local,
    PidNamespace(u32),
    Remote(String),
}

impl TargetKind {
    pub fn classify(target: &str) -> TargetKind {
        if target == "local" || target == "localhost" {
            return TargetKind::Local;
        }
        if let Ok(pid) = target.parse::<u32>() {
            if pid > 0 {
                return TargetKind::PidNamespace(pid);
            }
        }
        TargetKind::Remote(target.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Changed,
    Repaired,
    Failed,
}

impl Outcome {
    /// Derives the outcome from a finished run. Sentinel detection is
    /// plain substring containment over the whole captured stream;
    /// tokens split across lines by the producer are not recognized.
    pub fn classify(success: bool, stdout: &str, stderr: &str) -> Outcome {
        if !success {
            return Outcome::Failed;
        }
        if stderr.contains(REPAIRED_TOKEN) {
            return Outcome::Repaired;
        }
        if stdout.contains(CHANGED_TOKEN) {
            return Outcome::Changed;
        }
        Outcome::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Changed => "changed",
            Outcome::Repaired => "repaired",
            Outcome::Failed => "failed",
        }
    }
}

/// Captured result of one phase or protocol step.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub aux_error: String,
    pub outcome: Outcome,
}

impl RunResult {
    pub fn from_capture(success: bool, stdout: String, stderr: String, aux_error: String) -> Self {
        let outcome = Outcome::classify(success, &stdout, &stderr);
        RunResult {
            success,
            stdout,
            stderr,
            aux_error,
            outcome,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Quiet,
    Verbose,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    None,
    Password,
    Passwordless,
}

impl Escalation {
    pub fn requires_secret(self) -> bool {
        matches!(self, Escalation::Password)
    }

    pub fn is_escalated(self) -> bool {
        !matches!(self, Escalation::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Ssh,
    Tunnel,
}

/// Per-invocation execution options, decided once from the parsed
/// command line and passed by value through the call graph.
///
/// `secret` is populated only for password escalation, held in memory
/// only, and written exclusively to a child process's stdin.
#[derive(Clone)]
pub struct ExecOptions {
    pub mode: OutputMode,
    pub escalation: Escalation,
    pub transport: Transport,
    pub ssh_config: Option<PathBuf>,
    pub secret: Option<String>,
    pub run_id: String,
}

impl ExecOptions {
    pub fn new(run_id: String) -> Self {
        ExecOptions {
            mode: OutputMode::Quiet,
            escalation: Escalation::None,
            transport: Transport::Ssh,
            ssh_config: None,
            secret: None,
            run_id,
        }
    }
}

/// One line of the append-only audit log. Output and source fields
/// are base64 so embedded newlines and binary bytes survive the
/// line-oriented encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub app: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub start: Option<String>,
    pub namespace: String,
    pub script: String,
    pub target: String,
    pub task: String,
    pub phase: String,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duration: Option<String>,
}

pub fn encode_field(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}

pub fn decode_field(value: &str) -> Option<String> {
    let bytes = BASE64.decode(value.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}

type CleanupAction = Box<dyn FnOnce() + Send>;

/// Run-scoped cleanup slot. Holds at most one pending action,
/// replaced at each protocol stage transition; firing consumes it so
/// a double invocation is a no-op.
#[derive(Default)]
pub struct CleanupSlot {
    action: Mutex<Option<CleanupAction>>,
}

impl CleanupSlot {
    pub fn new() -> Self {
        CleanupSlot::default()
    }

    pub fn replace<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.action.lock().unwrap();
        *slot = Some(Box::new(action));
    }

    pub fn is_armed(&self) -> bool {
        self.action.lock().unwrap().is_some()
    }

    pub fn clear(&self) {
        let mut slot = self.action.lock().unwrap();
        *slot = None;
    }

    pub fn fire(&self) {
        let action = self.action.lock().unwrap().take();
        if let Some(action) = action {
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn classifies_target_kinds() {
        assert_eq!(TargetKind::classify("local"), TargetKind::Local);
        assert_eq!(TargetKind::classify("localhost"), TargetKind::Local);
        assert_eq!(TargetKind::classify("4242"), TargetKind::PidNamespace(4242));
        assert_eq!(TargetKind::classify("0"), TargetKind::Remote("0".to_string()));
        assert_eq!(
            TargetKind::classify("deploy@web1"),
            TargetKind::Remote("deploy@web1".to_string())
        );
    }

    #[test]
    fn outcome_failed_wins_over_sentinels() {
        let outcome = Outcome::classify(false, "__CHANGED__", "__REPAIRED__");
        assert_eq!(outcome, Outcome::Failed);
    }

    #[test]
    fn outcome_repaired_from_stderr() {
        let outcome = Outcome::classify(true, "", "fixed the unit __REPAIRED__\n");
        assert_eq!(outcome, Outcome::Repaired);
    }

    #[test]
    fn outcome_changed_from_stdout() {
        let outcome = Outcome::classify(true, "wrote file __CHANGED__\n", "");
        assert_eq!(outcome, Outcome::Changed);
    }

    #[test]
    fn outcome_ok_without_sentinels() {
        assert_eq!(Outcome::classify(true, "hi\n", ""), Outcome::Ok);
    }

    #[test]
    fn sentinel_must_be_contiguous() {
        // A token split by the producer across lines is not detected.
        assert_eq!(Outcome::classify(true, "__CHAN\nGED__", ""), Outcome::Ok);
    }

    #[test]
    fn encode_decode_round_trip() {
        let body = "echo hi\nprintf '%s' \"$1\"\n";
        assert_eq!(decode_field(&encode_field(body)).as_deref(), Some(body));
    }

    #[test]
    fn cleanup_slot_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let slot = CleanupSlot::new();
        let c = Arc::clone(&count);
        slot.replace(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        slot.fire();
        slot.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_slot_replace_drops_previous() {
        let count = Arc::new(AtomicUsize::new(0));
        let slot = CleanupSlot::new();
        let c1 = Arc::clone(&count);
        slot.replace(move || {
            c1.fetch_add(10, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        slot.replace(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        slot.fire();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn audit_record_omits_empty_fields() {
        let record = AuditRecord {
            app: APP_NAME.to_string(),
            id: "id".to_string(),
            start: None,
            namespace: "ns".to_string(),
            script: "ok".to_string(),
            target: "local".to_string(),
            task: "unlabeled".to_string(),
            phase: "main".to_string(),
            msg: "ok".to_string(),
            code: None,
            stdout: None,
            stderr: None,
            error: None,
            duration: None,
        };
        let line = serde_json::to_string(&record).expect("serialize");
        assert!(!line.contains("\"code\""));
        assert!(!line.contains("\"duration\""));
    }
}
