use std::io::ErrorKind;
use std::path::PathBuf;

use thiserror::Error;

use runr_domain::{Address, ExecOptions, Phase, RunResult, TargetKind, Transport};
use runr_exec::{shell_quote, Capture, CommandSpec, ProcessRunner, Runner, StreamKind};
use runr_ssh::{
    confirm_hostname, copy_tree, remote_script_path, run_script, HostCheckFailure, RemoteTarget,
    SshSession,
};

use crate::assemble::ScriptBundle;
use crate::context::RunContext;

/// Staging directory base name. Host-suffixed variants narrow a tree
/// to one target.
pub const FILES_DIR: &str = ".files";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    HostCheck(#[from] HostCheckFailure),
    #[error("failure copying files: {0}")]
    Copy(String),
    #[error("cannot run {program}: {detail}")]
    Spawn {
        program: String,
        detail: String,
        kind: Option<ErrorKind>,
    },
}

impl DispatchError {
    pub fn exit_code(&self) -> i32 {
        match self {
            DispatchError::HostCheck(_) => runr_domain::exit::NOT_FOUND,
            DispatchError::Copy(_) => runr_domain::exit::FAILED,
            DispatchError::Spawn { kind, .. } => match kind {
                Some(ErrorKind::NotFound) => runr_domain::exit::NOT_FOUND,
                Some(ErrorKind::PermissionDenied) => runr_domain::exit::NOT_EXECUTABLE,
                _ => runr_domain::exit::OS_ERR,
            },
        }
    }
}

/// Routes one invocation to the local, PID-namespace, or remote
/// branch. Built once after assembly; `prepare` does the remote
/// session setup and hostname confirmation, `stage_files` copies the
/// staging trees, `run_phase` executes one payload.
pub struct Dispatcher<'a> {
    ctx: &'a RunContext,
    address: &'a Address,
    bundle: &'a ScriptBundle,
    options: &'a ExecOptions,
    pub kind: TargetKind,
    session: Option<SshSession>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        ctx: &'a RunContext,
        address: &'a Address,
        bundle: &'a ScriptBundle,
        options: &'a ExecOptions,
    ) -> Self {
        Dispatcher {
            ctx,
            address,
            bundle,
            options,
            kind: TargetKind::classify(&address.target),
            session: None,
        }
    }

    /// For remote targets, builds the transport session and confirms
    /// the hostname once before anything is copied or run. The other
    /// branches need no preparation.
    pub fn prepare(&mut self, runner: &mut dyn Runner) -> Result<(), DispatchError> {
        let TargetKind::Remote(target) = &self.kind else {
            return Ok(());
        };
        let session = SshSession::new(
            RemoteTarget::parse(target),
            self.options.transport,
            self.resolve_ssh_config(),
        );
        confirm_hostname(&session, runner)?;
        self.session = Some(session);
        Ok(())
    }

    /// The explicit override wins; otherwise the first config file
    /// found under the tree root applies. The tunnel client manages
    /// its own hosts.
    fn resolve_ssh_config(&self) -> Option<PathBuf> {
        if self.options.transport == Transport::Tunnel {
            return None;
        }
        if let Some(config) = &self.options.ssh_config {
            return Some(config.clone());
        }
        ["ssh_config", ".ssh/config", "HOSTS"]
            .iter()
            .map(|candidate| self.ctx.root.join(candidate))
            .find(|path| path.is_file())
    }

    /// Copies every existing staging directory for this target, most
    /// general scope first. A failed copy aborts the run before any
    /// phase executes; `on_step` sees each attempt for auditing.
    pub fn stage_files(
        &self,
        runner: &mut dyn Runner,
        on_step: &mut dyn FnMut(&str, &Capture),
    ) -> Result<(), DispatchError> {
        for dir in self.staging_dirs() {
            if !self.ctx.root.join(&dir).is_dir() {
                continue;
            }
            let capture = self.copy_one(runner, &dir);
            on_step(&dir, &capture);
            if let Some(kind) = capture.spawn_error {
                return Err(self.spawn_error(&capture, kind));
            }
            if !capture.success {
                let detail = if capture.stderr.is_empty() {
                    capture.aux_error.clone()
                } else {
                    capture.stderr.clone()
                };
                return Err(DispatchError::Copy(format!("{dir}: {}", detail.trim_end())));
            }
        }
        Ok(())
    }

    fn staging_dirs(&self) -> Vec<String> {
        let scopes = [
            String::new(),
            format!("{}/", self.address.namespace),
            format!("{}/{}/", self.address.namespace, self.address.script),
        ];
        let suffixes: Vec<String> = match &self.kind {
            TargetKind::Local => vec![
                FILES_DIR.to_string(),
                format!("{FILES_DIR}-local"),
                format!("{FILES_DIR}-localhost"),
            ],
            TargetKind::PidNamespace(_) => vec![FILES_DIR.to_string()],
            TargetKind::Remote(target) => {
                let host = RemoteTarget::parse(target).host;
                vec![FILES_DIR.to_string(), format!("{FILES_DIR}-{host}")]
            }
        };
        scopes
            .iter()
            .flat_map(|scope| suffixes.iter().map(move |suffix| format!("{scope}{suffix}")))
            .collect()
    }

    fn copy_one(&self, runner: &mut dyn Runner, dir: &str) -> Capture {
        let source = self.ctx.root.join(dir);
        let source = shell_quote(&source.to_string_lossy());
        match &self.kind {
            TargetKind::Local => {
                let pipeline = format!(
                    "set -o errexit -o nounset -o noglob\n\
                     unset IFS\n\
                     tar -C {source} -cpf - . | tar -C / --no-same-owner -ompxf -\n"
                );
                let spec = CommandSpec::new(&self.bundle.interpreter)
                    .arg("-c")
                    .arg(pipeline)
                    .env("LC_ALL", "C");
                runner.run(&spec, None)
            }
            TargetKind::PidNamespace(pid) => {
                let pipeline = format!(
                    "tar -C {source} -cf - . | \
                     tar -C /proc/{pid}/root --no-same-owner --overwrite -omxpf -"
                );
                let spec = CommandSpec::new(&self.bundle.interpreter)
                    .arg("-c")
                    .arg(pipeline)
                    .env("LC_ALL", "C");
                runner.run(&spec, None)
            }
            TargetKind::Remote(_) => {
                // prepare() ran first, so the session exists.
                let Some(session) = &self.session else {
                    return Capture::default();
                };
                copy_tree(
                    session,
                    runner,
                    &self.bundle.interpreter,
                    &self.ctx.root.join(dir).to_string_lossy(),
                    self.options.escalation,
                    self.options.secret.as_deref(),
                    &self.ctx.run_id,
                )
            }
        }
    }

    /// Runs one phase payload on the target. For remote targets the
    /// scratch-file removal round trip is parked in the run context's
    /// cleanup slot; the caller fires it after the phase.
    pub fn run_phase(
        &self,
        runner: &mut dyn Runner,
        phase: Phase,
        payload: &str,
        on_line: Option<&mut dyn FnMut(StreamKind, &str)>,
    ) -> Result<RunResult, DispatchError> {
        let capture = match &self.kind {
            TargetKind::Local => {
                let spec = CommandSpec::new(&self.bundle.interpreter);
                self.run_spec(runner, &spec, Some(payload.as_bytes()), on_line)
            }
            TargetKind::PidNamespace(pid) => {
                let spec = CommandSpec::new("nsenter")
                    .args(["-a", "-r", "-t"])
                    .arg(pid.to_string())
                    .arg(&self.bundle.interpreter)
                    .arg("-c")
                    .arg(payload);
                self.run_spec(runner, &spec, None, on_line)
            }
            TargetKind::Remote(_) => {
                let Some(session) = &self.session else {
                    return Err(DispatchError::Spawn {
                        program: "ssh".to_string(),
                        detail: "remote session not prepared".to_string(),
                        kind: None,
                    });
                };
                let remote_path = remote_script_path(&self.ctx.run_id, phase.label());
                let cleanup = &self.ctx.cleanup;
                run_script(
                    session,
                    runner,
                    &self.bundle.interpreter,
                    payload,
                    &remote_path,
                    self.options.escalation,
                    self.options.secret.as_deref(),
                    &mut |spec| {
                        cleanup.replace(move || {
                            let _ = ProcessRunner.run(&spec, None);
                        });
                    },
                    on_line,
                )
            }
        };

        if let Some(kind) = capture.spawn_error {
            return Err(self.spawn_error(&capture, kind));
        }
        Ok(RunResult::from_capture(
            capture.success,
            capture.stdout,
            capture.stderr,
            capture.aux_error,
        ))
    }

    fn run_spec(
        &self,
        runner: &mut dyn Runner,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
        on_line: Option<&mut dyn FnMut(StreamKind, &str)>,
    ) -> Capture {
        match on_line {
            Some(cb) => runner.run_streaming(spec, stdin, cb),
            None => runner.run(spec, stdin),
        }
    }

    fn spawn_error(&self, capture: &Capture, kind: ErrorKind) -> DispatchError {
        let program = match &self.kind {
            TargetKind::Local => self.bundle.interpreter.clone(),
            TargetKind::PidNamespace(_) => "nsenter".to_string(),
            TargetKind::Remote(_) => match self.options.transport {
                Transport::Ssh => "ssh".to_string(),
                Transport::Tunnel => "tsh".to_string(),
            },
        };
        DispatchError::Spawn {
            program,
            detail: capture.aux_error.clone(),
            kind: Some(kind),
        }
    }
}
