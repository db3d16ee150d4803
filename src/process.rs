use crate::error::SandboxError;
use crate::guard::Sandbox;
use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout, timeout_at, Instant};

/// How long a child gets between SIGTERM and SIGKILL.
pub const TERMINATION_GRACE: Duration = Duration::from_secs(1);

pub const DEFAULT_SCRIPT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PACKAGE_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
	#[default]
	Auto,
	Python,
	Node,
}

impl Interpreter {
	pub fn program_for(self, file: &Path) -> Result<&'static str> {
		match self {
			Interpreter::Python => Ok("python3"),
			Interpreter::Node => Ok("node"),
			Interpreter::Auto => {
				let extension = file.extension()
					.map(|ext| ext.to_string_lossy().to_lowercase())
					.unwrap_or_default();
				match extension.as_str() {
					"py" => Ok("python3"),
					"js" | "mjs" => Ok("node"),
					_ => Err(SandboxError::UnsupportedInterpreter {
						extension: if extension.is_empty() {
							extension
						}
						else {
							format!(".{}", extension)
						}
					}.into()),
				}
			}
		}
	}
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
	Npm,
	Pip,
	Pip3,
}

impl PackageManager {
	pub fn program(self) -> &'static str {
		match self {
			PackageManager::Npm => "npm",
			PackageManager::Pip => "pip",
			PackageManager::Pip3 => "pip3",
		}
	}
}

const NPM_SUBCOMMANDS: &[&str] = &[
	"install",
	"uninstall",
	"list",
	"ls",
	"outdated",
	"view",
	"search",
	"update",
	"audit",
	"init",
	"run",
	"test",
	"start",
	"build",
];

const PIP_SUBCOMMANDS: &[&str] = &["install", "uninstall", "list", "show", "search", "freeze", "check"];

/// First-level subcommands each package manager may run.
#[derive(Debug)]
pub struct CommandPolicy {
	allowed: HashMap<PackageManager, &'static [&'static str]>,
}

static STANDARD_POLICY: Lazy<CommandPolicy> = Lazy::new(
	|| CommandPolicy {
		allowed: HashMap::from([
			(PackageManager::Npm, NPM_SUBCOMMANDS),
			(PackageManager::Pip, PIP_SUBCOMMANDS),
			(PackageManager::Pip3, PIP_SUBCOMMANDS),
		])
	}
);

impl CommandPolicy {
	pub fn standard() -> &'static CommandPolicy {
		&STANDARD_POLICY
	}

	pub fn check(&self, manager: PackageManager, args: &[String]) -> Result<()> {
		let subcommand = args.first().ok_or(SandboxError::MissingSubcommand)?;
		let allowed = self.allowed
			.get(&manager)
			.copied()
			.unwrap_or_default();
		if !allowed.contains(&subcommand.as_str()) {
			let tool = match manager {
				PackageManager::Npm => "npm",
				PackageManager::Pip | PackageManager::Pip3 => "pip",
			};
			return Err(SandboxError::CommandNotAllowed {
				tool: tool.to_string(),
				subcommand: subcommand.clone(),
				allowed: allowed.to_vec()
			}.into());
		}
		Ok(())
	}
}

/// Everything needed to launch one child. Arguments are passed as a list;
/// no shell sees them.
#[derive(Debug)]
pub struct ProcessSpec {
	pub program: String,
	pub args: Vec<String>,
	pub cwd: PathBuf,
	pub env: Vec<(String, String)>,
	pub timeout: Duration,
}

#[derive(Debug)]
pub struct ProcessResult {
	pub stdout: String,
	pub stderr: String,
	pub exit_code: Option<i32>,
}

impl ProcessResult {
	pub fn to_text(&self) -> String {
		let mut output = String::new();
		if !self.stdout.is_empty() {
			output.push_str("STDOUT:\n");
			output.push_str(&self.stdout);
		}
		if !self.stderr.is_empty() {
			if !output.is_empty() {
				output.push_str("\n\n");
			}
			output.push_str("STDERR:\n");
			output.push_str(&self.stderr);
		}
		let code = self.exit_code
			.map(|code| code.to_string())
			.unwrap_or_else(|| "null".to_string());
		output.push_str(&format!("\n\nExit code: {}", code));
		output
	}
}

pub async fn execute_file(
	sandbox: &Sandbox,
	file: &str,
	args: &[String],
	interpreter: Interpreter,
	working_directory: Option<&str>,
	timeout_ms: u64) -> Result<ProcessResult> {
	let valid = sandbox.validate(file)?;
	let program = interpreter.program_for(&valid)?;
	let cwd = resolve_working_directory(sandbox, working_directory).await?;
	let mut argv = Vec::with_capacity(args.len() + 1);
	argv.push(valid.to_string_lossy().to_string());
	argv.extend(args.iter().cloned());
	run(ProcessSpec {
		program: program.to_string(),
		args: argv,
		cwd,
		env: Vec::new(),
		timeout: Duration::from_millis(timeout_ms)
	}).await
}

pub async fn execute_package_manager(
	sandbox: &Sandbox,
	policy: &CommandPolicy,
	manager: PackageManager,
	args: &[String],
	working_directory: Option<&str>,
	timeout_ms: u64) -> Result<ProcessResult> {
	policy.check(manager, args)?;
	let cwd = resolve_working_directory(sandbox, working_directory).await?;
	run(ProcessSpec {
		program: manager.program().to_string(),
		args: args.to_vec(),
		cwd,
		env: vec![("NODE_ENV".to_string(), "production".to_string())],
		timeout: Duration::from_millis(timeout_ms)
	}).await
}

async fn resolve_working_directory(sandbox: &Sandbox, working_directory: Option<&str>) -> Result<PathBuf> {
	let Some(dir) = working_directory else {
		return Ok(sandbox.cwd().to_path_buf());
	};
	let valid = sandbox.validate(dir)?;
	let meta = tokio::fs::metadata(&valid).await?;
	if !meta.is_dir() {
		return Err(SandboxError::NotADirectory {
			path: valid
		}.into());
	}
	Ok(valid)
}

/// Run to completion or until the deadline. A nonzero exit is a normal
/// result; hitting the deadline is `SandboxError::Timeout`.
///
/// The child leads its own process group. The deadline covers draining both
/// pipes as well, so a background grandchild holding them open cannot stall
/// the call, and termination signals reach the whole group.
pub async fn run(spec: ProcessSpec) -> Result<ProcessResult> {
	let mut cmd = Command::new(&spec.program);
	cmd.args(&spec.args);
	cmd.current_dir(&spec.cwd);
	for (key, value) in &spec.env {
		cmd.env(key, value);
	}
	cmd.stdin(Stdio::null());
	cmd.stdout(Stdio::piped());
	cmd.stderr(Stdio::piped());
	cmd.kill_on_drop(true);
	#[cfg(unix)]
	cmd.process_group(0);
	let deadline = Instant::now() + spec.timeout;
	let mut child = cmd.spawn().with_context(|| format!("failed to spawn {}", spec.program))?;
	let group = child.id();
	tracing::debug!(program = %spec.program, pid = group.unwrap_or_default(), "spawned child");
	let stdout = child.stdout
		.take()
		.ok_or_else(|| anyhow!("{} stdout missing", spec.program))?;
	let stderr = child.stderr
		.take()
		.ok_or_else(|| anyhow!("{} stderr missing", spec.program))?;
	let mut stdout_task = tokio::spawn(capture(stdout));
	let mut stderr_task = tokio::spawn(capture(stderr));
	let finished = timeout_at(
		deadline,
		async {
			let status = child.wait().await?;
			let stdout = (&mut stdout_task).await.unwrap_or_default();
			let stderr = (&mut stderr_task).await.unwrap_or_default();
			Ok::<_, std::io::Error>((status, stdout, stderr))
		}
	).await;
	match finished {
		Ok(outcome) => {
			let (status, stdout, stderr) = outcome?;
			Ok(ProcessResult {
				stdout,
				stderr,
				exit_code: status.code()
			})
		}
		Err(_) => {
			terminate(&mut child, group, &spec.program).await;
			stdout_task.abort();
			stderr_task.abort();
			Err(SandboxError::Timeout {
				millis: spec.timeout.as_millis() as u64
			}.into())
		}
	}
}

async fn terminate(child: &mut Child, group: Option<u32>, program: &str) {
	tracing::warn!(program = %program, "deadline reached, sending SIGTERM");
	signal_group(child, group, GroupSignal::Term);
	if timeout(TERMINATION_GRACE, child.wait()).await.is_err() {
		tracing::warn!(program = %program, "still running after grace period, killing");
	}
	signal_group(child, group, GroupSignal::Kill);
	if timeout(TERMINATION_GRACE, child.wait()).await.is_err() {
		tracing::warn!(program = %program, "child did not exit after SIGKILL");
	}
}

#[derive(Clone, Copy)]
enum GroupSignal {
	Term,
	Kill,
}

/// Signal every process in the child's group. Once the leader has exited
/// the group may still hold background processes, so the group is always
/// targeted rather than the pid.
#[cfg(unix)]
fn signal_group(child: &mut Child, group: Option<u32>, signal: GroupSignal) {
	let signal = match signal {
		GroupSignal::Term => libc::SIGTERM,
		GroupSignal::Kill => libc::SIGKILL,
	};
	match group {
		Some(pgid) => unsafe {
			libc::kill(-(pgid as libc::pid_t), signal);
		},
		None => {
			let _ = child.start_kill();
		}
	}
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _group: Option<u32>, _signal: GroupSignal) {
	let _ = child.start_kill();
}

async fn capture<R>(mut reader: R) -> String
where
	R: AsyncRead + Unpin, {
	let mut collected = Vec::new();
	let mut buf = vec![0u8; 8_192];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => collected.extend_from_slice(&buf[..n]),
			Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
			Err(_) => break,
		}
	}
	String::from_utf8_lossy(&collected).into_owned()
}
