use std::path::{Path, PathBuf};

use runr_domain::Address;

use crate::{assemble, CoreError};

/// What argv resolved to: a runnable address, or the README display
/// side channel.
#[derive(Debug)]
pub enum Resolution {
    Run(Address),
    Readme { path: PathBuf, token: String },
}

/// Resolves the positional arguments into an [`Address`]. The first
/// token is a path when it carries `/` or `:`; otherwise it is the
/// target and the path follows. Both checks and the README probe are
/// rooted at `root`.
pub fn resolve(root: &Path, argv: &[String]) -> Result<Resolution, CoreError> {
    if argv.is_empty() {
        return Err(CoreError::Usage("missing arguments".to_string()));
    }

    let (target, path_index) = if argv[0].contains('/') || argv[0].contains(':') {
        ("local".to_string(), 0usize)
    } else {
        (argv[0].clone(), 1usize)
    };

    for token in argv.iter().take(2) {
        let trimmed = token.trim_end_matches(['/', ':']);
        if trimmed.is_empty() {
            continue;
        }
        if let Some(path) = find_readme(&root.join(trimmed)) {
            return Ok(Resolution::Readme {
                path,
                token: trimmed.to_string(),
            });
        }
    }

    let token = argv.get(path_index).ok_or_else(not_specified)?;
    let (namespace, script, mut trailing_args) = parse_path_token(token)?;
    trailing_args.extend(argv[path_index + 1..].iter().cloned());

    let ns_dir = root.join(&namespace);
    if !ns_dir.is_dir() {
        return Err(CoreError::MissingInput(format!(
            "`{namespace}` (namespace) is not a directory"
        )));
    }
    let script_dir = ns_dir.join(&script);
    if !script_dir.is_dir() {
        return Err(CoreError::MissingInput(format!(
            "`{namespace}/{script}` is not a directory"
        )));
    }
    let run_file = script_dir.join(assemble::RUN_FILE);
    if !run_file.is_file() {
        return Err(CoreError::MissingInput(format!(
            "`{namespace}/{script}/{}` not found",
            assemble::RUN_FILE
        )));
    }

    Ok(Resolution::Run(Address {
        target,
        namespace,
        script,
        trailing_args,
    }))
}

fn not_specified() -> CoreError {
    CoreError::Usage("`namespace:script` not specified".to_string())
}

/// Accepts the solo shape (`ns:` / `ns/` → script `.`) and the
/// hierarchical shape (`ns:script[:first-arg]`).
fn parse_path_token(token: &str) -> Result<(String, String, Vec<String>), CoreError> {
    for suffix in ['/', ':'] {
        if let Some(ns) = token.strip_suffix(suffix) {
            if !ns.is_empty() && !ns.contains(':') && !ns.contains('/') {
                return Ok((ns.to_string(), ".".to_string(), Vec::new()));
            }
        }
    }

    let mut parts = token.splitn(3, ':');
    let namespace = parts.next().unwrap_or_default();
    let script = parts.next().unwrap_or_default();
    if namespace.is_empty() || script.is_empty() {
        return Err(not_specified());
    }
    let mut args = Vec::new();
    if let Some(first_arg) = parts.next() {
        args.push(first_arg.to_string());
    }
    Ok((namespace.to_string(), script.to_string(), args))
}

/// A documentation bundle matching `README*` directly under `dir`.
/// Lexicographically first match wins so repeated lookups are stable.
pub fn find_readme(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut matches: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with("README"))
        })
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    matches.sort();
    matches.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scaffold() -> TempDir {
        let dir = TempDir::new().expect("temp dir");
        fs::create_dir_all(dir.path().join("ns/ok")).expect("mkdir");
        fs::write(dir.path().join("ns/ok/script"), "echo hi\n").expect("write");
        fs::write(dir.path().join("ns/script"), "echo solo\n").expect("write");
        dir
    }

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolves_local_hierarchical_shape() {
        let dir = scaffold();
        let resolution = resolve(dir.path(), &args(&["ns:ok"])).expect("resolve");
        match resolution {
            Resolution::Run(address) => {
                assert_eq!(address.target, "local");
                assert_eq!(address.namespace, "ns");
                assert_eq!(address.script, "ok");
                assert!(address.trailing_args.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn resolves_remote_target_with_args() {
        let dir = scaffold();
        let resolution =
            resolve(dir.path(), &args(&["deploy@web1", "ns:ok:first", "second"])).expect("resolve");
        match resolution {
            Resolution::Run(address) => {
                assert_eq!(address.target, "deploy@web1");
                assert_eq!(address.trailing_args, vec!["first", "second"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn resolves_solo_shape_to_dot_script() {
        let dir = scaffold();
        let resolution = resolve(dir.path(), &args(&["ns:"])).expect("resolve");
        match resolution {
            Resolution::Run(address) => {
                assert_eq!(address.namespace, "ns");
                assert_eq!(address.script, ".");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn missing_run_file_is_missing_input() {
        let dir = scaffold();
        fs::create_dir_all(dir.path().join("ns/empty")).expect("mkdir");
        let err = resolve(dir.path(), &args(&["ns:empty"])).unwrap_err();
        assert!(matches!(err, CoreError::MissingInput(_)));
        assert_eq!(err.exit_code(), runr_domain::exit::NO_INPUT);
    }

    #[test]
    fn missing_namespace_is_missing_input() {
        let dir = scaffold();
        let err = resolve(dir.path(), &args(&["nope:ok"])).unwrap_err();
        assert!(matches!(err, CoreError::MissingInput(_)));
    }

    #[test]
    fn malformed_token_is_usage_error() {
        let dir = scaffold();
        let err = resolve(dir.path(), &args(&["web1"])).unwrap_err();
        assert!(matches!(err, CoreError::Usage(_)));
        assert_eq!(err.exit_code(), runr_domain::exit::USAGE);
    }

    #[test]
    fn empty_argv_is_usage_error() {
        let dir = scaffold();
        let err = resolve(dir.path(), &[]).unwrap_err();
        assert!(matches!(err, CoreError::Usage(_)));
    }

    #[test]
    fn readme_side_channel_wins() {
        let dir = scaffold();
        fs::create_dir_all(dir.path().join("docs")).expect("mkdir");
        fs::write(dir.path().join("docs/README.md"), "DOCS\n").expect("write");
        let resolution = resolve(dir.path(), &args(&["docs"])).expect("resolve");
        match resolution {
            Resolution::Readme { path, token } => {
                assert_eq!(token, "docs");
                assert!(path.ends_with("docs/README.md"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn readme_checked_on_second_token_too() {
        let dir = scaffold();
        fs::write(dir.path().join("ns/ok/README"), "OK DOCS\n").expect("write");
        let resolution = resolve(dir.path(), &args(&["web1", "ns/ok"])).expect("resolve");
        assert!(matches!(resolution, Resolution::Readme { .. }));
    }
}
