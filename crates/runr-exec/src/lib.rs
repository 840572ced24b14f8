use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;

/// A child invocation kept as data so protocol code can be exercised
/// without spawning anything. Parameters are carried as discrete
/// arguments; only `sh -c` pipelines embed them, and those go through
/// [`shell_quote`] first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Captured result of one child process.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub aux_error: String,
    pub spawn_error: Option<ErrorKind>,
}

impl Capture {
    fn from_spawn_failure(err: &std::io::Error) -> Capture {
        Capture {
            success: false,
            aux_error: err.to_string(),
            spawn_error: Some(err.kind()),
            ..Capture::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Seam between protocol sequencing and actual process execution.
/// Production code uses [`ProcessRunner`]; tests substitute a scripted
/// runner to verify round-trip ordering and argument shapes.
pub trait Runner {
    fn run(&mut self, spec: &CommandSpec, stdin: Option<&[u8]>) -> Capture;

    fn run_streaming(
        &mut self,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
        on_line: &mut dyn FnMut(StreamKind, &str),
    ) -> Capture {
        let capture = self.run(spec, stdin);
        for line in capture.stdout.lines() {
            on_line(StreamKind::Stdout, line);
        }
        for line in capture.stderr.lines() {
            on_line(StreamKind::Stderr, line);
        }
        capture
    }
}

#[derive(Debug, Default)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&mut self, spec: &CommandSpec, stdin: Option<&[u8]>) -> Capture {
        let mut cmd = spec.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Capture::from_spawn_failure(&err),
        };

        if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
            let input = input.to_vec();
            // Written from a helper thread so a child that fills its
            // output pipe before draining stdin cannot deadlock us.
            thread::spawn(move || {
                let _ = handle.write_all(&input);
            });
        }

        match child.wait_with_output() {
            Ok(output) => Capture {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                aux_error: String::new(),
                spawn_error: None,
            },
            Err(err) => Capture::from_spawn_failure(&err),
        }
    }

    fn run_streaming(
        &mut self,
        spec: &CommandSpec,
        stdin: Option<&[u8]>,
        on_line: &mut dyn FnMut(StreamKind, &str),
    ) -> Capture {
        let mut cmd = spec.command();
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Capture::from_spawn_failure(&err),
        };

        if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
            let input = input.to_vec();
            thread::spawn(move || {
                let _ = handle.write_all(&input);
            });
        }

        let (tx, rx) = mpsc::channel::<(StreamKind, String)>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(Result::ok) {
                    let _ = tx.send((StreamKind::Stdout, line));
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                let reader = BufReader::new(stderr);
                for line in reader.lines().map_while(Result::ok) {
                    let _ = tx.send((StreamKind::Stderr, line));
                }
            }));
        }
        drop(tx);

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        for (kind, line) in rx {
            on_line(kind, &line);
            let buf = match kind {
                StreamKind::Stdout => &mut stdout_buf,
                StreamKind::Stderr => &mut stderr_buf,
            };
            buf.push_str(&line);
            buf.push('\n');
        }
        for reader in readers {
            let _ = reader.join();
        }

        match child.wait() {
            Ok(status) => Capture {
                success: status.success(),
                stdout: stdout_buf,
                stderr: stderr_buf,
                aux_error: String::new(),
                spawn_error: None,
            },
            Err(err) => {
                let mut capture = Capture::from_spawn_failure(&err);
                capture.stdout = stdout_buf;
                capture.stderr = stderr_buf;
                capture
            }
        }
    }
}

/// Single-quotes `input` for embedding into a `sh -c` pipeline.
pub fn shell_quote(input: &str) -> String {
    let mut quoted = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
