//! Supervised execution of external commands.
//!
//! Every build-stage invocation runs through [`Executor`]: the child is
//! spawned under an explicit [`BuildEnvironment`], the controller blocks on
//! completion, and output is tee'd line-by-line into the session log as it
//! is produced. The executor itself never blocks on interactive input; on
//! failure it returns a structured [`CommandFailure`] and the caller's
//! [`RetryDecider`] drives the unbounded retry protocol.

use nix::sys::signal::{self, SigHandler, Signal};
use std::fmt;
use std::io::BufRead;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use crate::models::BuildEnvironment;
use crate::prompt::Prompt;
use crate::session::{EnvSnapshot, SessionLog, DEFAULT_DENYLIST};

static CANCELLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    CANCELLED.store(true, Ordering::SeqCst);
}

/// Trap interrupt/termination signals for the lifetime of the process.
/// The flag is observed after a blocked child returns.
pub fn install_cancel_handler() {
    // SAFETY: the handler only stores into an atomic.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }
}

/// Whether a trapped signal has requested cancellation.
pub fn cancel_requested() -> bool {
    CANCELLED.load(Ordering::SeqCst)
}

/// One external command to run: program, arguments, working directory, and
/// the pipeline stage it belongs to (for diagnostics on failure).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stage: String,
    /// Hand the terminal to the child (menu-driven tools); no teeing.
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(program: S, args: Vec<String>, stage: &str) -> Self {
        CommandSpec {
            program: program.into(),
            args,
            cwd: None,
            stage: stage.to_string(),
            interactive: false,
        }
    }

    pub fn cwd(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// The full command line as displayed to the operator.
    pub fn argv_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Successful completion of a supervised command.
#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
}

/// Structured failure report: the argument vector executed, the exit
/// status, and the invoking stage for diagnostic display.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub argv: Vec<String>,
    pub code: Option<i32>,
    pub stage: String,
    pub detail: Option<String>,
    /// Set when the failure was caused by a trapped cancellation signal.
    pub cancelled: bool,
}

impl CommandFailure {
    pub fn argv_string(&self) -> String {
        self.argv.join(" ")
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' failed in stage '{}'", self.argv_string(), self.stage)?;
        match self.code {
            Some(code) => write!(f, " with exit code {code}")?,
            None => write!(f, " (terminated by signal)")?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Binary retry decision offered to the operator after a failure.
/// Default answer is "no".
pub trait RetryDecider {
    fn should_retry(&mut self, failure: &CommandFailure) -> bool;
}

/// Any prompt implementation can act as the retry decider.
impl<P: Prompt + ?Sized> RetryDecider for P {
    fn should_retry(&mut self, failure: &CommandFailure) -> bool {
        self.confirm(&format!("{failure}. Retry?"), false)
    }
}

/// Runs external commands as supervised children.
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor {
    /// Echo the resolved command line before execution.
    pub debug: bool,
}

impl Executor {
    pub fn new(debug: bool) -> Self {
        Executor { debug }
    }

    fn command(&self, spec: &CommandSpec, env: &BuildEnvironment) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        env.apply(&mut cmd);
        if self.debug {
            println!("+ {}", spec.argv_string());
        }
        cmd
    }

    /// Run a command, teeing stdout/stderr to the console and (when given)
    /// into the session log, and block until termination.
    pub fn run(
        &self,
        spec: &CommandSpec,
        env: &BuildEnvironment,
        mut log: Option<&mut SessionLog>,
    ) -> Result<ExecOutput, CommandFailure> {
        let mut cmd = self.command(spec, env);

        if spec.interactive {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = cmd
                .status()
                .map_err(|e| spawn_failure(spec, e.to_string()))?;
            return classify(spec, status.code(), status.success());
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failure(spec, e.to_string()))?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        for line in rx {
            println!("{line}");
            if let Some(log) = log.as_deref_mut() {
                let _ = log.append_line(&line);
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child
            .wait()
            .map_err(|e| spawn_failure(spec, format!("wait failed: {e}")))?;
        classify(spec, status.code(), status.success())
    }

    /// Run a command quietly and return its stdout as a string. Used for
    /// short queries (version strings, ELF inspection), not build stages.
    pub fn run_capture(
        &self,
        spec: &CommandSpec,
        env: &BuildEnvironment,
    ) -> Result<String, CommandFailure> {
        let mut cmd = self.command(spec, env);
        cmd.stdin(Stdio::null());
        let output = cmd
            .output()
            .map_err(|e| spawn_failure(spec, e.to_string()))?;
        if !output.status.success() {
            return Err(CommandFailure {
                argv: argv_of(spec),
                code: output.status.code(),
                stage: spec.stage.clone(),
                detail: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
                cancelled: cancel_requested(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn argv_of(spec: &CommandSpec) -> Vec<String> {
    let mut argv = vec![spec.program.clone()];
    argv.extend(spec.args.iter().cloned());
    argv
}

fn spawn_failure(spec: &CommandSpec, detail: String) -> CommandFailure {
    CommandFailure {
        argv: argv_of(spec),
        code: None,
        stage: spec.stage.clone(),
        detail: Some(detail),
        cancelled: false,
    }
}

fn classify(
    spec: &CommandSpec,
    code: Option<i32>,
    success: bool,
) -> Result<ExecOutput, CommandFailure> {
    if success {
        Ok(ExecOutput { code: 0 })
    } else {
        // Only a trapped operator signal counts as cancellation. A child
        // killed externally (OOM killer, stray SIGKILL) is a plain failure
        // and still gets the retry offer; an operator Ctrl+C sets the flag
        // because the controller shares the foreground process group.
        Err(CommandFailure {
            argv: argv_of(spec),
            code,
            stage: spec.stage.clone(),
            detail: None,
            cancelled: cancel_requested(),
        })
    }
}

/// Drive the retry protocol around one supervised command.
///
/// On failure: report the full command line and stage, capture the session
/// log (logs are flushed at every failure, not only at session end), then
/// ask the decider. Declined or cancelled failures are returned to the
/// caller for the fatal teardown path. Accepted retries invoke the restart
/// hook (notification + log banner reinit when a timed session is active)
/// and re-run the identical command. The loop is unbounded by design: each
/// retry is an explicit operator decision.
pub fn run_with_retry<D: RetryDecider + ?Sized>(
    executor: &Executor,
    spec: &CommandSpec,
    env: &BuildEnvironment,
    log: &mut SessionLog,
    before: &EnvSnapshot,
    decider: &mut D,
    mut restart_hook: Option<&mut dyn FnMut(&mut SessionLog)>,
) -> Result<ExecOutput, CommandFailure> {
    loop {
        let _ = log.transcript_header(&spec.argv_string());
        match executor.run(spec, env, Some(log)) {
            Ok(output) => return Ok(output),
            Err(failure) => {
                log::error!("{failure}");
                let _ = log.note(&format!("FAILED: {failure}"));
                let _ = log.capture(before, DEFAULT_DENYLIST);

                if failure.cancelled || !decider.should_retry(&failure) {
                    return Err(failure);
                }
                if let Some(hook) = restart_hook.as_deref_mut() {
                    hook(log);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EnvSnapshot;
    use tempfile::tempdir;

    struct CountingDecider {
        yes_remaining: usize,
        asked: usize,
    }

    impl RetryDecider for CountingDecider {
        fn should_retry(&mut self, _failure: &CommandFailure) -> bool {
            self.asked += 1;
            if self.yes_remaining > 0 {
                self.yes_remaining -= 1;
                true
            } else {
                false
            }
        }
    }

    fn make_log(dir: &std::path::Path) -> SessionLog {
        SessionLog::create(dir, "KF-test-0", "== test ==".to_string()).expect("log")
    }

    #[test]
    fn test_run_success() {
        let executor = Executor::default();
        let spec = CommandSpec::new("true", vec![], "testing");
        let env = BuildEnvironment::default();
        assert!(executor.run(&spec, &env, None).is_ok());
    }

    #[test]
    fn test_run_failure_reports_stage_and_argv() {
        let executor = Executor::default();
        let spec = CommandSpec::new("false", vec![], "building");
        let env = BuildEnvironment::default();
        let failure = executor.run(&spec, &env, None).unwrap_err();
        assert_eq!(failure.stage, "building");
        assert_eq!(failure.argv, vec!["false".to_string()]);
        assert_eq!(failure.code, Some(1));
        assert!(!failure.cancelled);
    }

    #[test]
    fn test_run_missing_program_is_spawn_failure() {
        let executor = Executor::default();
        let spec = CommandSpec::new("definitely-not-a-real-binary", vec![], "testing");
        let env = BuildEnvironment::default();
        let failure = executor.run(&spec, &env, None).unwrap_err();
        assert!(failure.detail.is_some());
    }

    #[test]
    fn test_run_capture_collects_stdout() {
        let executor = Executor::default();
        let spec = CommandSpec::new("echo", vec!["4.14.180".to_string()], "version");
        let env = BuildEnvironment::default();
        let out = executor.run_capture(&spec, &env).expect("capture");
        assert_eq!(out.trim(), "4.14.180");
    }

    #[test]
    fn test_tee_appends_output_to_log() {
        let temp = tempdir().expect("tempdir");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new("echo", vec!["hello-build".to_string()], "building");
        let env = BuildEnvironment::default();
        executor.run(&spec, &env, Some(&mut log)).expect("run");

        let content = std::fs::read_to_string(log.path()).expect("read");
        assert!(content.contains("hello-build"));
    }

    #[test]
    fn test_signal_killed_child_still_offers_retry() {
        // A child terminated by an external signal must reach the decider;
        // only a trapped operator signal bypasses the retry offer.
        let temp = tempdir().expect("tempdir");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new(
            "sh",
            vec!["-c".to_string(), "kill -9 $$".to_string()],
            "building",
        );
        let env = BuildEnvironment::default();
        let before = EnvSnapshot::capture();
        let mut decider = CountingDecider {
            yes_remaining: 0,
            asked: 0,
        };

        let failure = run_with_retry(
            &executor,
            &spec,
            &env,
            &mut log,
            &before,
            &mut decider,
            None,
        )
        .unwrap_err();
        assert_eq!(decider.asked, 1);
        assert!(!failure.cancelled);
        assert!(failure.code.is_none());
    }

    #[test]
    fn test_retry_declined_returns_failure() {
        let temp = tempdir().expect("tempdir");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new("false", vec![], "building");
        let env = BuildEnvironment::default();
        let before = EnvSnapshot::capture();
        let mut decider = CountingDecider {
            yes_remaining: 0,
            asked: 0,
        };

        let result = run_with_retry(
            &executor,
            &spec,
            &env,
            &mut log,
            &before,
            &mut decider,
            None,
        );
        assert!(result.is_err());
        assert_eq!(decider.asked, 1);
    }

    #[test]
    fn test_retry_loop_runs_until_decliner_stops() {
        let temp = tempdir().expect("tempdir");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new("false", vec![], "building");
        let env = BuildEnvironment::default();
        let before = EnvSnapshot::capture();
        let mut decider = CountingDecider {
            yes_remaining: 2,
            asked: 0,
        };

        let result = run_with_retry(
            &executor,
            &spec,
            &env,
            &mut log,
            &before,
            &mut decider,
            None,
        );
        assert!(result.is_err());
        // Two accepted retries plus the final declined one.
        assert_eq!(decider.asked, 3);
    }

    #[test]
    fn test_retry_transcript_entries_per_attempt() {
        // A command that fails twice then succeeds: exactly three
        // transcript headers, no fatal result.
        let temp = tempdir().expect("tempdir");
        let script = temp.path().join("flaky.sh");
        let marker = temp.path().join("attempts");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho run >> {m}\n[ $(wc -l < {m}) -ge 3 ] && exit 0\nexit 1\n",
                m = marker.display()
            ),
        )
        .expect("script");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new(
            "sh",
            vec![script.display().to_string()],
            "building",
        );
        let env = BuildEnvironment::default();
        let before = EnvSnapshot::capture();
        let mut decider = CountingDecider {
            yes_remaining: 5,
            asked: 0,
        };

        let result = run_with_retry(
            &executor,
            &spec,
            &env,
            &mut log,
            &before,
            &mut decider,
            None,
        );
        assert!(result.is_ok());
        assert_eq!(decider.asked, 2);

        let content = std::fs::read_to_string(log.path()).expect("read");
        assert_eq!(content.matches("$ sh ").count(), 3);
    }

    #[test]
    fn test_restart_hook_invoked_on_accepted_retry() {
        let temp = tempdir().expect("tempdir");
        let mut log = make_log(temp.path());
        let executor = Executor::default();
        let spec = CommandSpec::new("false", vec![], "building");
        let env = BuildEnvironment::default();
        let before = EnvSnapshot::capture();
        let mut decider = CountingDecider {
            yes_remaining: 1,
            asked: 0,
        };
        let mut hook_calls = 0usize;
        let mut hook = |log: &mut SessionLog| {
            hook_calls += 1;
            let _ = log.reinit();
        };

        let _ = run_with_retry(
            &executor,
            &spec,
            &env,
            &mut log,
            &before,
            &mut decider,
            Some(&mut hook),
        );
        drop(hook);
        assert_eq!(hook_calls, 1);
    }
}
