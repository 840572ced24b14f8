use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use runr_core::address::{self, Resolution};
use runr_core::assemble::{self, ScriptBundle};
use runr_core::audit;
use runr_core::context::{self, RunContext};
use runr_core::dispatch::Dispatcher;
use runr_core::readme;
use runr_core::report;
use runr_domain::{
    exit, Address, Escalation, ExecOptions, OutputMode, Phase, TargetKind, Transport,
};
use runr_exec::{ProcessRunner, StreamKind};

#[derive(Parser)]
#[command(name = "runr")]
#[command(version, about = "Layered script runner for local, container, and ssh targets")]
struct RunrCli {
    /// Escalate on the target with sudo, prompting for a password
    #[arg(short = 's', long)]
    sudo: bool,
    /// Escalate on the target with passwordless sudo
    #[arg(long)]
    no_password: bool,
    /// Reach the target through the tunnel client instead of ssh
    #[arg(short = 't', long)]
    tunnel: bool,
    /// ssh configuration file override
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Decorated progress output on stderr
    #[arg(short = 'v', long)]
    verbose: bool,
    /// One JSON line per phase on stdout
    #[arg(long)]
    json: bool,
    /// Print the assembled payload instead of running it
    #[arg(long)]
    dump: bool,
    /// Render the run history table and exit
    #[arg(long)]
    report: bool,
    /// [target] namespace:script[:first-arg] [args…]
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = RunrCli::parse();
    let root = context::default_root();
    let mode = output_mode(&cli);

    if cli.report {
        return handle_report(&root, mode);
    }

    let resolution = match address::resolve(&root, &cli.args) {
        Ok(resolution) => resolution,
        Err(err) => return fail(mode, &err.to_string(), err.exit_code()),
    };
    let address = match resolution {
        Resolution::Run(address) => address,
        Resolution::Readme { path, token } => return handle_readme(&path, &token, mode),
    };

    let bundle = match assemble::assemble(&root, &address) {
        Ok(bundle) => bundle,
        Err(err) => return fail(mode, &err.to_string(), err.exit_code()),
    };

    if cli.dump {
        print!("{}", bundle.main_payload);
        return exit::OK;
    }

    let ctx = RunContext::new(root, mode);

    #[cfg(unix)]
    context::install_signal_handlers();

    let options = match exec_options(&cli, &ctx, &address) {
        Ok(options) => options,
        Err(code) => return code,
    };

    if mode == OutputMode::Verbose {
        eprintln!("runr {} ({})", env!("CARGO_PKG_VERSION"), ctx.run_id);
    }

    run_phases(&ctx, &address, &bundle, &options)
}

fn output_mode(cli: &RunrCli) -> OutputMode {
    if cli.json {
        OutputMode::Json
    } else if cli.verbose || std::io::stdout().is_terminal() {
        OutputMode::Verbose
    } else {
        OutputMode::Quiet
    }
}

fn exec_options(cli: &RunrCli, ctx: &RunContext, address: &Address) -> Result<ExecOptions, i32> {
    let mut options = ExecOptions::new(ctx.run_id.clone());
    options.mode = ctx.mode;
    options.transport = if cli.tunnel {
        Transport::Tunnel
    } else {
        Transport::Ssh
    };
    options.ssh_config = cli.config.clone();
    options.escalation = if cli.sudo {
        Escalation::Password
    } else if cli.no_password {
        Escalation::Passwordless
    } else {
        Escalation::None
    };

    // Only the remote protocols consume the escalation secret, so the
    // prompt is skipped for local and namespace targets.
    let remote = matches!(TargetKind::classify(&address.target), TargetKind::Remote(_));
    if remote && options.escalation == Escalation::Password {
        match rpassword::prompt_password("sudo password: ") {
            Ok(secret) => options.secret = Some(secret),
            Err(err) => {
                // Ctrl-C at the prompt lands here as a read error.
                let code = context::prompt_failure_code();
                let message = if code == exit::INTERRUPTED {
                    "interrupted".to_string()
                } else {
                    format!("cannot read password: {err}")
                };
                return Err(fail(ctx.mode, &message, code));
            }
        }
    }
    Ok(options)
}

fn handle_report(root: &std::path::Path, mode: OutputMode) -> i32 {
    let records = match audit::load_records(&root.join(audit::LOG_FILE)) {
        Ok(records) => records,
        Err(err) => return fail(mode, &err.to_string(), err.exit_code()),
    };
    let color = mode != OutputMode::Json && std::io::stdout().is_terminal();
    print!("{}", report::render(&records, color));
    exit::OK
}

fn handle_readme(path: &std::path::Path, token: &str, mode: OutputMode) -> i32 {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => return fail(mode, &format!("cannot read {}: {err}", path.display()), exit::NO_INPUT),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let decorated = mode == OutputMode::Verbose && std::io::stdout().is_terminal();
    print!("{}", readme::render(token, &file_name, &body, decorated));
    exit::OK
}

fn run_phases(
    ctx: &RunContext,
    address: &Address,
    bundle: &ScriptBundle,
    options: &ExecOptions,
) -> i32 {
    let mut runner = ProcessRunner;
    let mut dispatcher = Dispatcher::new(ctx, address, bundle, options);

    if let Err(err) = dispatcher.prepare(&mut runner) {
        return fail(ctx.mode, &err.to_string(), err.exit_code());
    }

    let staged = dispatcher.stage_files(&mut runner, &mut |dir, capture| {
        if ctx.mode == OutputMode::Verbose {
            eprintln!("Copying {dir}\u{2026}");
        }
        let record = audit::step_record(
            ctx,
            address,
            &bundle.task_label,
            "copy",
            capture.success,
            &capture.stderr,
        );
        if let Err(err) = audit::append(&ctx.log_path(), &record) {
            eprintln!("runr: {err}");
        }
    });
    if let Err(err) = staged {
        return fail(ctx.mode, &err.to_string(), err.exit_code());
    }
    // The staging copies can span many child processes; a signal
    // during any of them stops the run before the first phase.
    if context::interrupt_abort(ctx, address, &bundle.task_label) {
        return fail(ctx.mode, "interrupted", exit::INTERRUPTED);
    }

    let mut failed = false;
    for phase in [Phase::Prelude, Phase::Main, Phase::Epilogue] {
        // A failed prelude vetoes the main body; the epilogue is
        // attempted regardless so teardown still runs.
        if phase == Phase::Main && failed {
            continue;
        }
        let Some(payload) = bundle.payload_for(phase) else {
            continue;
        };

        if ctx.mode == OutputMode::Verbose {
            eprintln!(
                "Running {} of {} on {}\u{2026}",
                phase.label(),
                address.display_name(),
                address.target
            );
        }

        let mut printer = StreamPrinter::new(&address.target);
        let streaming = ctx.mode == OutputMode::Verbose;
        let mut on_line = |kind: StreamKind, line: &str| printer.line(kind, line);
        let result = dispatcher.run_phase(
            &mut runner,
            phase,
            payload,
            streaming.then_some(&mut on_line as &mut dyn FnMut(StreamKind, &str)),
        );
        printer.close();

        // The parked removal round trip for remote scratch files.
        ctx.cleanup.fire();

        let result = match result {
            Ok(result) => result,
            Err(err) => return fail(ctx.mode, &err.to_string(), err.exit_code()),
        };

        let record = audit::phase_record(
            ctx,
            address,
            &bundle.task_label,
            phase,
            bundle.source_for(phase),
            &bundle.exported_vars,
            &result,
        );
        if let Err(err) = audit::append(&ctx.log_path(), &record) {
            return fail(ctx.mode, &err.to_string(), err.exit_code());
        }

        match ctx.mode {
            OutputMode::Quiet => {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            OutputMode::Json => match serde_json::to_string(&record) {
                Ok(line) => println!("{line}"),
                Err(err) => eprintln!("runr: {err}"),
            },
            OutputMode::Verbose => {}
        }

        if !result.success {
            failed = true;
        }

        if context::interrupt_abort(ctx, address, &bundle.task_label) {
            return fail(ctx.mode, "interrupted", exit::INTERRUPTED);
        }
    }

    if failed {
        exit::FAILED
    } else {
        exit::OK
    }
}

fn fail(mode: OutputMode, message: &str, code: i32) -> i32 {
    match mode {
        OutputMode::Json => println!(
            "{}",
            serde_json::json!({ "app": "runr", "error": message })
        ),
        _ => eprintln!("runr: {message}"),
    }
    code
}

/// Boxed live output in verbose mode. A header opens when a stream
/// first produces a line, and again whenever output switches streams.
struct StreamPrinter {
    target: String,
    current: Option<StreamKind>,
}

impl StreamPrinter {
    fn new(target: &str) -> Self {
        StreamPrinter {
            target: target.to_string(),
            current: None,
        }
    }

    fn line(&mut self, kind: StreamKind, line: &str) {
        if self.current != Some(kind) {
            self.close();
            let name = match kind {
                StreamKind::Stdout => "stdout",
                StreamKind::Stderr => "stderr",
            };
            eprintln!("{} \u{250c}\u{2500} {name}", self.target);
            self.current = Some(kind);
        }
        eprintln!(" \u{2502} {line}");
    }

    fn close(&mut self) {
        if self.current.take().is_some() {
            eprintln!(" \u{2514}\u{2500}");
        }
    }
}
