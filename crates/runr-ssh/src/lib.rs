use std::path::PathBuf;

use thiserror::Error;

use runr_domain::{Escalation, Transport};
use runr_exec::{shell_quote, Capture, CommandSpec, Runner, StreamKind};

/// The `[user@]host` token from the command line. `host` is the bare
/// host portion used for hostname confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub login: String,
    pub host: String,
}

impl RemoteTarget {
    pub fn parse(token: &str) -> RemoteTarget {
        let host = match token.split_once('@') {
            Some((_, host)) => host.to_string(),
            None => token.to_string(),
        };
        RemoteTarget {
            login: token.to_string(),
            host,
        }
    }
}

/// Transport configuration for one invocation: plain ssh (optionally
/// with a `-F` config override) or the tunnel client. Every remote
/// round trip of every protocol goes through [`SshSession::remote_spec`]
/// or [`SshSession::pipeline_fragment`] so the flag set stays in one
/// place: batch-friendly (`-T`), no agent or X11 forwarding (`-a -x`),
/// locale pinned to C.
#[derive(Debug, Clone)]
pub struct SshSession {
    pub target: RemoteTarget,
    pub transport: Transport,
    pub config: Option<PathBuf>,
}

impl SshSession {
    pub fn new(target: RemoteTarget, transport: Transport, config: Option<PathBuf>) -> Self {
        // The tunnel client manages its own hosts; a config override
        // only ever applies to plain ssh.
        let config = match transport {
            Transport::Ssh => config,
            Transport::Tunnel => None,
        };
        SshSession {
            target,
            transport,
            config,
        }
    }

    /// One remote command as a child invocation of the transport.
    pub fn remote_spec(&self, remote: &str) -> CommandSpec {
        let spec = match self.transport {
            Transport::Ssh => {
                let mut spec = CommandSpec::new("ssh");
                if let Some(config) = &self.config {
                    spec = spec.arg("-F").arg(config.to_string_lossy());
                }
                spec.args(["-a", "-T", "-x"])
                    .arg(&self.target.login)
                    .arg(remote)
            }
            Transport::Tunnel => CommandSpec::new("tsh")
                .arg("ssh")
                .arg(&self.target.login)
                .arg(remote),
        };
        spec.env("LC_ALL", "C")
    }

    /// The transport invocation as a quoted fragment for embedding in
    /// a local `sh -c` pipeline (`tar … | <fragment>`).
    pub fn pipeline_fragment(&self, remote: &str) -> String {
        match self.transport {
            Transport::Ssh => {
                let mut fragment = String::from("ssh");
                if let Some(config) = &self.config {
                    fragment.push_str(" -F ");
                    fragment.push_str(&shell_quote(&config.to_string_lossy()));
                }
                fragment.push_str(" -a -T -x ");
                fragment.push_str(&shell_quote(&self.target.login));
                fragment.push(' ');
                fragment.push_str(&shell_quote(remote));
                fragment
            }
            Transport::Tunnel => format!(
                "tsh ssh {} {}",
                shell_quote(&self.target.login),
                shell_quote(remote)
            ),
        }
    }
}

/// Remote temporary names are scoped by run id so concurrent
/// invocations against the same host never collide.
pub fn remote_script_path(run_id: &str, phase: &str) -> String {
    format!("./.runr.scr.{run_id}.{phase}")
}

fn staging_dir_name(run_id: &str) -> String {
    format!(".runr.dir.{run_id}")
}

fn staging_script_name(run_id: &str) -> String {
    format!("./.runr.tar.{run_id}")
}

#[derive(Debug, Error)]
pub enum HostCheckFailure {
    #[error("hostname {expected} does not match remote host {reported}")]
    Mismatch { expected: String, reported: String },
    #[error("{host} does not exist or is unreachable")]
    Unreachable { host: String, capture: Capture },
}

/// Confirms that the transport actually lands on the requested host
/// before any file transfer or script execution. Guards against ssh
/// config aliases silently pointing elsewhere.
pub fn confirm_hostname(
    session: &SshSession,
    runner: &mut dyn Runner,
) -> Result<String, HostCheckFailure> {
    let capture = runner.run(&session.remote_spec("uname -n"), None);
    if !capture.success {
        return Err(HostCheckFailure::Unreachable {
            host: session.target.host.clone(),
            capture,
        });
    }
    let reported = capture
        .stdout
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    if reported != session.target.host {
        return Err(HostCheckFailure::Mismatch {
            expected: session.target.host.clone(),
            reported,
        });
    }
    Ok(reported)
}

fn escalated_exec(session: &SshSession, escalation: Escalation, command: &str) -> CommandSpec {
    match escalation {
        Escalation::None => session.remote_spec(command),
        Escalation::Passwordless => session.remote_spec(&format!("sudo -n -- {command}")),
        Escalation::Password => {
            session.remote_spec(&format!("sudo -k --prompt=\"\" -S -s -- {command}"))
        }
    }
}

fn secret_stdin(escalation: Escalation, secret: Option<&str>) -> Option<Vec<u8>> {
    if escalation.requires_secret() {
        secret.map(|s| format!("{s}\n").into_bytes())
    } else {
        None
    }
}

/// The three-round-trip remote script execution protocol: stage the
/// payload, run it, remove it. The removal round trip is handed to
/// `on_cleanup` as soon as the upload succeeds, so the caller can park
/// it in the run's cleanup slot before execution starts; firing the
/// slot afterwards is the normal third round trip.
#[allow(clippy::too_many_arguments)]
pub fn run_script(
    session: &SshSession,
    runner: &mut dyn Runner,
    interp: &str,
    payload: &str,
    remote_path: &str,
    escalation: Escalation,
    secret: Option<&str>,
    on_cleanup: &mut dyn FnMut(CommandSpec),
    mut on_line: Option<&mut dyn FnMut(StreamKind, &str)>,
) -> Capture {
    let upload = runner.run(
        &session.remote_spec(&format!("cat - > {remote_path}")),
        Some(payload.as_bytes()),
    );
    if !upload.success {
        return upload;
    }
    on_cleanup(session.remote_spec(&format!("rm -f {remote_path}")));

    let command = format!("{} {remote_path}", shell_quote(interp));
    let spec = escalated_exec(session, escalation, &command);
    let stdin = secret_stdin(escalation, secret);
    match on_line.as_deref_mut() {
        Some(cb) => runner.run_streaming(&spec, stdin.as_deref(), cb),
        None => runner.run(&spec, stdin.as_deref()),
    }
}

/// Copies a staging directory onto the remote root filesystem,
/// choosing the protocol variant by escalation level.
pub fn copy_tree(
    session: &SshSession,
    runner: &mut dyn Runner,
    interp: &str,
    dir: &str,
    escalation: Escalation,
    secret: Option<&str>,
    run_id: &str,
) -> Capture {
    match escalation {
        Escalation::None => quick_copy(session, runner, interp, dir, ""),
        Escalation::Passwordless => quick_copy(session, runner, interp, dir, "sudo -n -- "),
        Escalation::Password => escalated_copy(session, runner, interp, dir, secret, run_id),
    }
}

fn quick_copy(
    session: &SshSession,
    runner: &mut dyn Runner,
    interp: &str,
    dir: &str,
    remote_prefix: &str,
) -> Capture {
    let remote = format!("{remote_prefix}tar -C / --overwrite --no-same-owner -omxpzf -");
    let pipeline = format!(
        "set -o errexit -o nounset -o noglob\ntar -C {} -cpzf - . | {}",
        shell_quote(dir),
        session.pipeline_fragment(&remote)
    );
    let spec = CommandSpec::new(interp)
        .arg("-c")
        .arg(pipeline)
        .env("LC_ALL", "C");
    runner.run(&spec, None)
}

/// The privileged copy needs three round trips because stdin carries
/// the secret during escalation and therefore cannot also stream the
/// archive. Stage 1 uploads a small extraction script, stage 2 pipes
/// the archive into a per-run temporary directory without escalation,
/// stage 3 runs the staged script under sudo to move the tree into
/// place and drop both temporaries.
fn escalated_copy(
    session: &SshSession,
    runner: &mut dyn Runner,
    interp: &str,
    dir: &str,
    secret: Option<&str>,
    run_id: &str,
) -> Capture {
    let tmp_dir = staging_dir_name(run_id);
    let tmp_script = staging_script_name(run_id);

    let extract_script = format!(
        "set -efu\n\
         LC_ALL=C\n\
         unset IFS\n\
         tar -C {tmp_dir} -cpf - . | tar -C / --overwrite --no-same-owner -ompxf -\n\
         rm -rf {tmp_dir}\n\
         rm -f {tmp_script}\n"
    );
    let upload = runner.run(
        &session.remote_spec(&format!("cat - > {tmp_script}")),
        Some(extract_script.as_bytes()),
    );
    if !upload.success {
        return upload;
    }

    let pipeline = format!(
        "set -o errexit -o nounset -o noglob\n{}\ntar -C {} -cpzf - . | {}",
        session.pipeline_fragment(&format!("mkdir {tmp_dir}")),
        shell_quote(dir),
        session.pipeline_fragment(&format!("tar -C {tmp_dir} --no-same-owner -omxpzf -"))
    );
    let stage = CommandSpec::new(interp)
        .arg("-c")
        .arg(pipeline)
        .env("LC_ALL", "C");
    let staged = runner.run(&stage, None);
    if !staged.success {
        return staged;
    }

    let command = format!("{} {tmp_script}", shell_quote(interp));
    let spec = escalated_exec(session, Escalation::Password, &command);
    runner.run(&spec, secret_stdin(Escalation::Password, secret).as_deref())
}
