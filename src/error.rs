use std::path::PathBuf;

/// Failures the sandbox reports to callers. Raw I/O errors travel next to
/// these inside `anyhow::Error` and are classified separately.
#[derive(Debug)]
pub enum SandboxError {
	AccessDenied {
		path: PathBuf,
		reason: &'static str,
	},
	ParentMissing {
		parent: PathBuf,
	},
	NoMatch {
		old_text: String,
	},
	CommandNotAllowed {
		tool: String,
		subcommand: String,
		allowed: Vec<&'static str>,
	},
	MissingSubcommand,
	Timeout {
		millis: u64,
	},
	NotADirectory {
		path: PathBuf,
	},
	DestinationExists {
		path: PathBuf,
	},
	UnsupportedInterpreter {
		extension: String,
	},
	InvalidArguments {
		tool: String,
		message: String,
	},
	UnknownTool {
		name: String,
	},
}

impl SandboxError {
	pub fn code(&self) -> &'static str {
		match self {
			SandboxError::AccessDenied { .. } => "ACCESS_DENIED",
			SandboxError::ParentMissing { .. } => "PARENT_MISSING",
			SandboxError::NoMatch { .. } => "NO_MATCH",
			SandboxError::CommandNotAllowed { .. } => "COMMAND_NOT_ALLOWED",
			SandboxError::MissingSubcommand => "MISSING_SUBCOMMAND",
			SandboxError::Timeout { .. } => "TIMEOUT",
			SandboxError::NotADirectory { .. } => "NOT_A_DIRECTORY",
			SandboxError::DestinationExists { .. } => "DESTINATION_EXISTS",
			SandboxError::UnsupportedInterpreter { .. } => "UNSUPPORTED_INTERPRETER",
			SandboxError::InvalidArguments { .. } => "INVALID_ARGUMENTS",
			SandboxError::UnknownTool { .. } => "UNKNOWN_TOOL",
		}
	}
}

impl std::fmt::Display for SandboxError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			SandboxError::AccessDenied { path, reason } => {
				write!(f, "Access denied - {}: {}", reason, path.display())
			}
			SandboxError::ParentMissing { parent } => {
				write!(f, "Parent directory does not exist: {}", parent.display())
			}
			SandboxError::NoMatch { old_text } => {
				write!(f, "Could not find exact match for edit:\n{}", old_text)
			}
			SandboxError::CommandNotAllowed { tool, subcommand, allowed } => write!(
				f,
				"{} command '{}' is not allowed. Allowed commands: {}",
				tool,
				subcommand,
				allowed.join(", ")
			),
			SandboxError::MissingSubcommand => write!(f, "No command arguments provided"),
			SandboxError::Timeout { millis } => write!(f, "Process timed out after {}ms", millis),
			SandboxError::NotADirectory { path } => {
				write!(f, "Working directory must be a directory: {}", path.display())
			}
			SandboxError::DestinationExists { path } => {
				write!(f, "Destination already exists: {}", path.display())
			}
			SandboxError::UnsupportedInterpreter { extension } => write!(
				f,
				"Cannot auto-detect interpreter for file extension {}. Please specify interpreter explicitly.",
				if extension.is_empty() {
					"(none)"
				}
				else {
					extension.as_str()
				}
			),
			SandboxError::InvalidArguments { tool, message } => {
				write!(f, "Invalid arguments for {}: {}", tool, message)
			}
			SandboxError::UnknownTool { name } => write!(f, "Unknown tool: {}", name),
		}
	}
}

impl std::error::Error for SandboxError {}

/// Stable code for any error surfaced by a tool call.
pub fn error_code(err: &anyhow::Error) -> &'static str {
	if let Some(sandbox) = err.downcast_ref::<SandboxError>() {
		return sandbox.code();
	}
	if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
		return match io_err.kind() {
			std::io::ErrorKind::NotFound => "FILE_NOT_FOUND",
			std::io::ErrorKind::PermissionDenied => "PERMISSION_DENIED",
			std::io::ErrorKind::InvalidData => "INVALID_DATA",
			_ => "IO_ERROR",
		};
	}
	"EXECUTION_ERROR"
}
