use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use runr_domain::{encode_field, Address, AuditRecord, Phase, RunResult, APP_NAME, REDACTED};

use crate::context::RunContext;
use crate::CoreError;

pub const LOG_FILE: &str = "runr.json";

/// Appends one record as a single JSON line. The file is opened and
/// closed per call so concurrent invocations interleave whole lines.
pub fn append(path: &Path, record: &AuditRecord) -> Result<(), CoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| CoreError::CantCreate(format!("cannot open {}: {err}", path.display())))?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}").map_err(CoreError::Io)?;
    Ok(())
}

/// Reads the whole log back. A missing file is an empty history;
/// unparsable lines are skipped rather than poisoning the report.
pub fn load_records(path: &Path) -> Result<Vec<AuditRecord>, CoreError> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CoreError::Io(err)),
    };
    Ok(body
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Replaces every injected value with the redaction marker before the
/// payload is persisted.
pub fn redact(payload: &str, vars: &[(String, String)]) -> String {
    let mut redacted = payload.to_string();
    for (_, value) in vars {
        if !value.is_empty() {
            redacted = redacted.replace(value, REDACTED);
        }
    }
    redacted
}

fn base_record(ctx: &RunContext, address: &Address, task: &str, phase: &str) -> AuditRecord {
    AuditRecord {
        app: APP_NAME.to_string(),
        id: ctx.run_id.clone(),
        start: Some(ctx.started_at_display()),
        namespace: address.namespace.clone(),
        script: address.script.clone(),
        target: address.target.clone(),
        task: task.to_string(),
        phase: phase.to_string(),
        msg: String::new(),
        code: None,
        stdout: None,
        stderr: None,
        error: None,
        duration: None,
    }
}

fn optional_encoded(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(encode_field(value))
    }
}

/// One finished phase. `source` is the raw phase body; it and the
/// captured streams are redacted against the injected values before
/// encoding, so no field ever decodes to a clear secret.
pub fn phase_record(
    ctx: &RunContext,
    address: &Address,
    task: &str,
    phase: Phase,
    source: &str,
    vars: &[(String, String)],
    result: &RunResult,
) -> AuditRecord {
    let mut record = base_record(ctx, address, task, phase.label());
    record.msg = result.outcome.as_str().to_string();
    record.code = Some(encode_field(&redact(source, vars)));
    record.stdout = optional_encoded(&redact(&result.stdout, vars));
    record.stderr = optional_encoded(&redact(&result.stderr, vars));
    if !result.aux_error.is_empty() {
        record.error = Some(result.aux_error.clone());
    }
    record.duration = Some(ctx.elapsed_display());
    record
}

/// One protocol sub-step, such as a staging copy. Carries no timing,
/// so it stays out of the history table.
pub fn step_record(
    ctx: &RunContext,
    address: &Address,
    task: &str,
    step: &str,
    success: bool,
    stderr: &str,
) -> AuditRecord {
    let mut record = base_record(ctx, address, task, step);
    record.msg = if success { "ok" } else { "failed" }.to_string();
    record.stderr = optional_encoded(stderr);
    record
}

/// Written when a signal cut the run short. Output fields stay empty
/// since the interrupted child owns them.
pub fn interrupted_record(ctx: &RunContext, address: &Address, task: &str) -> AuditRecord {
    let mut record = base_record(ctx, address, task, "run");
    record.msg = "interrupted".to_string();
    record.duration = Some(ctx.elapsed_display());
    record
}
