use std::path::Path;

use runr_domain::Address;
use runr_exec::shell_quote;
use walkdir::WalkDir;

use crate::CoreError;

pub const RUN_FILE: &str = "script";
pub const PRELUDE_FILE: &str = "prelude";
pub const EPILOGUE_FILE: &str = "epilogue";
pub const INTERP_FILE: &str = "shell";
pub const TASK_FILE: &str = "task";
pub const INCLUDE_FILE: &str = "VARS";
pub const LIB_DIR: &str = ".lib";

pub const DEFAULT_INTERP: &str = "sh";
pub const DEFAULT_TASK: &str = "unlabeled";

/// Assembled payloads for one invocation. The prelude and epilogue
/// variants exist only when their files do, and share the same prefix
/// (exports, arguments, libraries, include) as the main payload.
#[derive(Debug, Clone)]
pub struct ScriptBundle {
    pub main_payload: String,
    pub prelude_payload: Option<String>,
    pub epilogue_payload: Option<String>,
    /// The raw run file body, before any prefix. Audited verbatim.
    pub raw_code: String,
    pub raw_prelude: Option<String>,
    pub raw_epilogue: Option<String>,
    pub interpreter: String,
    pub task_label: String,
    /// Names and values injected from the environment, in payload
    /// order. Values must never reach the audit log in clear.
    pub exported_vars: Vec<(String, String)>,
}

impl ScriptBundle {
    pub fn payload_for(&self, phase: runr_domain::Phase) -> Option<&str> {
        match phase {
            runr_domain::Phase::Prelude => self.prelude_payload.as_deref(),
            runr_domain::Phase::Main => Some(&self.main_payload),
            runr_domain::Phase::Epilogue => self.epilogue_payload.as_deref(),
        }
    }

    /// The unmodified body for a phase, as read from disk. This is
    /// what audit records carry, so the log shows the source without
    /// the injected prefix.
    pub fn source_for(&self, phase: runr_domain::Phase) -> &str {
        match phase {
            runr_domain::Phase::Prelude => self.raw_prelude.as_deref().unwrap_or_default(),
            runr_domain::Phase::Main => &self.raw_code,
            runr_domain::Phase::Epilogue => self.raw_epilogue.as_deref().unwrap_or_default(),
        }
    }
}

/// Builds the payloads for `address` under `root`. The prefix order
/// is fixed: injected variables, positional arguments, library
/// fragments (global, namespace, script scope), the shared include
/// file, then the body.
pub fn assemble(root: &Path, address: &Address) -> Result<ScriptBundle, CoreError> {
    let script_dir = root.join(address.script_dir());

    let exported_vars = collect_env_vars(std::env::vars());
    let mut prefix = String::new();
    for (name, value) in &exported_vars {
        prefix.push_str(&format!("export {name}={}\n", shell_quote(value)));
    }

    if !address.trailing_args.is_empty() {
        let quoted: Vec<String> = address
            .trailing_args
            .iter()
            .map(|arg| shell_quote(arg))
            .collect();
        prefix.push_str(&format!("set -- {}\n", quoted.join(" ")));
    }

    for lib_dir in [
        root.join(LIB_DIR),
        root.join(&address.namespace).join(LIB_DIR),
        script_dir.join(LIB_DIR),
    ] {
        append_lib_fragments(&lib_dir, &mut prefix)?;
    }

    let include = root.join(INCLUDE_FILE);
    if include.is_file() {
        push_fragment(&mut prefix, &std::fs::read_to_string(&include)?);
    }

    let raw_code = std::fs::read_to_string(script_dir.join(RUN_FILE))?;
    let main_payload = format!("{prefix}{raw_code}");
    let raw_prelude = optional_body(&script_dir.join(PRELUDE_FILE))?;
    let raw_epilogue = optional_body(&script_dir.join(EPILOGUE_FILE))?;
    let prelude_payload = raw_prelude.as_deref().map(|body| format!("{prefix}{body}"));
    let epilogue_payload = raw_epilogue.as_deref().map(|body| format!("{prefix}{body}"));

    let interpreter = first_line_or(&script_dir.join(INTERP_FILE), DEFAULT_INTERP);
    let task_label = resolve_task_label(&script_dir, &address.trailing_args);

    Ok(ScriptBundle {
        main_payload,
        prelude_payload,
        epilogue_payload,
        raw_code,
        raw_prelude,
        raw_epilogue,
        interpreter,
        task_label,
        exported_vars,
    })
}

/// Prefixed environment variables, sorted by name so payload text is
/// stable across invocations.
fn collect_env_vars(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let mut collected: Vec<(String, String)> = vars
        .filter_map(|(name, value)| {
            let stripped = name.strip_prefix(runr_domain::ENV_PREFIX)?;
            if stripped.is_empty() {
                return None;
            }
            Some((stripped.to_string(), value))
        })
        .collect();
    collected.sort_by(|a, b| a.0.cmp(&b.0));
    collected
}

/// Appends every file under `dir`, depth-first, sorted by file name.
/// A missing directory is fine; an unreadable entry is not.
fn append_lib_fragments(dir: &Path, prefix: &mut String) -> Result<(), CoreError> {
    if !dir.is_dir() {
        return Ok(());
    }
    let walker = WalkDir::new(dir).follow_links(true).sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        push_fragment(prefix, &std::fs::read_to_string(entry.path())?);
    }
    Ok(())
}

fn push_fragment(prefix: &mut String, body: &str) {
    prefix.push_str(body);
    if !body.is_empty() && !body.ends_with('\n') {
        prefix.push('\n');
    }
}

fn optional_body(path: &Path) -> Result<Option<String>, CoreError> {
    if !path.is_file() {
        return Ok(None);
    }
    Ok(Some(std::fs::read_to_string(path)?))
}

fn first_line_or(path: &Path, fallback: &str) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|body| body.lines().next().map(str::trim).map(str::to_string))
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Task label precedence: environment override, then the `task` file,
/// then the joined trailing arguments, then the fixed default.
fn resolve_task_label(script_dir: &Path, trailing_args: &[String]) -> String {
    if let Ok(label) = std::env::var(runr_domain::TASK_ENV) {
        if !label.is_empty() {
            return label;
        }
    }
    let from_file = first_line_or(&script_dir.join(TASK_FILE), "");
    if !from_file.is_empty() {
        return from_file;
    }
    if !trailing_args.is_empty() {
        return trailing_args.join(" ");
    }
    DEFAULT_TASK.to_string()
}
