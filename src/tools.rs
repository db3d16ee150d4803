use crate::error::{error_code, SandboxError};
use crate::fs;
use crate::patch::{self, EditOperation};
use crate::process::{self, Interpreter, PackageManager, DEFAULT_PACKAGE_TIMEOUT_MS, DEFAULT_SCRIPT_TIMEOUT_MS};
use crate::server::Config;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Deserialize)]
struct PathArgs {
	path: String,
}

#[derive(Deserialize)]
struct ReadMultipleFilesArgs {
	paths: Vec<String>,
}

#[derive(Deserialize)]
struct WriteFileArgs {
	path: String,
	content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditFileArgs {
	path: String,
	edits: Vec<EditOperation>,
	#[serde(default)]
	dry_run: bool,
}

#[derive(Deserialize)]
struct MoveFileArgs {
	source: String,
	destination: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchFilesArgs {
	path: String,
	pattern: String,
	#[serde(default)]
	exclude_patterns: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteFileArgs {
	file: String,
	#[serde(default)]
	args: Vec<String>,
	#[serde(default)]
	interpreter: Interpreter,
	working_directory: Option<String>,
	#[serde(default = "default_script_timeout")]
	timeout: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutePackageManagerArgs {
	command: PackageManager,
	args: Vec<String>,
	working_directory: Option<String>,
	#[serde(default = "default_package_timeout")]
	timeout: u64,
}

fn default_script_timeout() -> u64 {
	DEFAULT_SCRIPT_TIMEOUT_MS
}

fn default_package_timeout() -> u64 {
	DEFAULT_PACKAGE_TIMEOUT_MS
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T> {
	serde_json::from_value(arguments.clone()).map_err(
		|err| {
			SandboxError::InvalidArguments {
				tool: tool.to_string(),
				message: err.to_string()
			}.into()
		}
	)
}

/// Run one tool call. Failures never escape: they come back as an
/// `isError` result carrying a stable code.
pub async fn call_tool(config: &Config, name: &str, arguments: &Value) -> Value {
	match dispatch(config, name, arguments).await {
		Ok(text) => tool_success(text),
		Err(err) => {
			tracing::warn!(tool = name, code = error_code(&err), error = %format!("{:#}", err), "tool call failed");
			tool_error(&err)
		}
	}
}

async fn dispatch(config: &Config, name: &str, arguments: &Value) -> Result<String> {
	let sandbox = &config.sandbox;
	match name {
		"read_file" => {
			let args: PathArgs = parse_args(name, arguments)?;
			fs::read_file(sandbox, &args.path).await
		}
		"read_multiple_files" => {
			let args: ReadMultipleFilesArgs = parse_args(name, arguments)?;
			Ok(fs::read_multiple_files(sandbox, &args.paths).await)
		}
		"write_file" => {
			let args: WriteFileArgs = parse_args(name, arguments)?;
			fs::write_file(sandbox, &args.path, &args.content).await?;
			Ok(format!("Successfully wrote to {}", args.path))
		}
		"edit_file" => {
			let args: EditFileArgs = parse_args(name, arguments)?;
			let valid = sandbox.validate(&args.path)?;
			patch::apply_file_edits(&valid, &args.edits, args.dry_run).await
		}
		"create_directory" => {
			let args: PathArgs = parse_args(name, arguments)?;
			fs::create_directory(sandbox, &args.path).await?;
			Ok(format!("Successfully created directory {}", args.path))
		}
		"list_directory" => {
			let args: PathArgs = parse_args(name, arguments)?;
			fs::list_directory(sandbox, &args.path).await
		}
		"directory_tree" => {
			let args: PathArgs = parse_args(name, arguments)?;
			let tree = fs::directory_tree(sandbox, &args.path).await?;
			Ok(serde_json::to_string_pretty(&tree)?)
		}
		"move_file" => {
			let args: MoveFileArgs = parse_args(name, arguments)?;
			fs::move_file(sandbox, &args.source, &args.destination).await?;
			Ok(format!("Successfully moved {} to {}", args.source, args.destination))
		}
		"search_files" => {
			let args: SearchFilesArgs = parse_args(name, arguments)?;
			let found = fs::search_files(sandbox, &args.path, &args.pattern, &args.exclude_patterns)?;
			if found.is_empty() {
				return Ok("No matches found".to_string());
			}
			Ok(found.iter()
				.map(|path| path.display().to_string())
				.collect::<Vec<_>>()
				.join("\n"))
		}
		"get_file_info" => {
			let args: PathArgs = parse_args(name, arguments)?;
			Ok(fs::file_info(sandbox, &args.path).await?.to_text())
		}
		"list_allowed_directories" => {
			let roots = sandbox.roots()
				.iter()
				.map(|root| root.path.display().to_string())
				.collect::<Vec<_>>();
			Ok(format!("Allowed directories:\n{}", roots.join("\n")))
		}
		"execute_file" => {
			let args: ExecuteFileArgs = parse_args(name, arguments)?;
			let result = process::execute_file(
				sandbox,
				&args.file,
				&args.args,
				args.interpreter,
				args.working_directory.as_deref(),
				args.timeout
			).await?;
			Ok(result.to_text())
		}
		"execute_package_manager" => {
			let args: ExecutePackageManagerArgs = parse_args(name, arguments)?;
			let result = process::execute_package_manager(
				sandbox,
				config.policy,
				args.command,
				&args.args,
				args.working_directory.as_deref(),
				args.timeout
			).await?;
			Ok(result.to_text())
		}
		_ => Err(SandboxError::UnknownTool {
			name: name.to_string()
		}.into()),
	}
}

fn tool_success(text: String) -> Value {
	json!({
		"content": [
			{
				"type": "text",
				"text": text
			}
		]
	})
}

fn tool_error(err: &anyhow::Error) -> Value {
	json!({
		"isError": true,
		"structuredContent": {
			"code": error_code(err)
		},
		"content": [
			{
				"type": "text",
				"text": format!("Error: {:#}", err)
			}
		]
	})
}

fn path_schema(description: &str) -> Value {
	json!({
		"type": "object",
		"properties": {
			"path": { "type": "string", "description": description }
		},
		"required": ["path"]
	})
}

pub fn tool_definitions() -> Vec<Value> {
	vec![
	json!({
		"name": "read_file",
		"description": "Read the full text of one file inside the allowed directories.",
		"inputSchema": path_schema("File to read.")
	}),
	json!({
		"name": "read_multiple_files",
		"description": "Read several files at once. Each file is returned under its path; a file that cannot be read is reported inline without failing the others.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"paths": { "type": "array", "items": { "type": "string" } }
			},
			"required": ["paths"]
		}
	}),
	json!({
		"name": "write_file",
		"description": "Create a file or replace its contents entirely. Existing files are overwritten without confirmation.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string" },
				"content": { "type": "string" }
			},
			"required": ["path", "content"]
		}
	}),
	json!({
		"name": "edit_file",
		"description": "Apply ordered search/replace edits to a text file and return a unified diff. Falls back to whitespace-insensitive line matching when the text is not found verbatim. Nothing is written if any edit fails.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string" },
				"edits": {
					"type": "array",
					"items": {
						"type": "object",
						"properties": {
							"oldText": { "type": "string", "description": "Text to search for." },
							"newText": { "type": "string", "description": "Replacement text." }
						},
						"required": ["oldText", "newText"]
					}
				},
				"dryRun": { "type": "boolean", "default": false, "description": "Return the diff without writing." }
			},
			"required": ["path", "edits"]
		}
	}),
	json!({
		"name": "create_directory",
		"description": "Create a directory, including missing intermediate directories. Succeeds if it already exists.",
		"inputSchema": path_schema("Directory to create.")
	}),
	json!({
		"name": "list_directory",
		"description": "List the entries of a directory, each prefixed with [FILE] or [DIR].",
		"inputSchema": path_schema("Directory to list.")
	}),
	json!({
		"name": "directory_tree",
		"description": "Recursive JSON tree of a directory. Entries carry name and type; directories also carry children.",
		"inputSchema": path_schema("Directory at the top of the tree.")
	}),
	json!({
		"name": "move_file",
		"description": "Move or rename a file or directory. Fails if the destination already exists.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"source": { "type": "string" },
				"destination": { "type": "string" }
			},
			"required": ["source", "destination"]
		}
	}),
	json!({
		"name": "search_files",
		"description": "Recursively find files and directories whose name contains the pattern, ignoring case. Returns full paths.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"path": { "type": "string", "description": "Directory to search from." },
				"pattern": { "type": "string" },
				"excludePatterns": {
					"type": "array",
					"items": { "type": "string" },
					"default": [],
					"description": "Globs relative to path; a plain name excludes every directory with that name."
				}
			},
			"required": ["path", "pattern"]
		}
	}),
	json!({
		"name": "get_file_info",
		"description": "Size, timestamps, type and permission bits of a file or directory.",
		"inputSchema": path_schema("File or directory to inspect.")
	}),
	json!({
		"name": "list_allowed_directories",
		"description": "List the directories this server may access.",
		"inputSchema": {
			"type": "object",
			"properties": {},
			"required": []
		}
	}),
	json!({
		"name": "execute_file",
		"description": "Run a Python or Node.js script and capture stdout, stderr and the exit code. The interpreter is picked from the extension (.py, .js, .mjs) unless given.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"file": { "type": "string" },
				"args": { "type": "array", "items": { "type": "string" }, "default": [] },
				"interpreter": { "type": "string", "enum": ["python", "node", "auto"], "default": "auto" },
				"workingDirectory": { "type": "string" },
				"timeout": { "type": "number", "default": DEFAULT_SCRIPT_TIMEOUT_MS, "description": "Milliseconds before the script is terminated." }
			},
			"required": ["file"]
		}
	}),
	json!({
		"name": "execute_package_manager",
		"description": "Run an allow-listed npm or pip subcommand (install, list, ...) and capture its output.",
		"inputSchema": {
			"type": "object",
			"properties": {
				"command": { "type": "string", "enum": ["npm", "pip", "pip3"] },
				"args": { "type": "array", "items": { "type": "string" } },
				"workingDirectory": { "type": "string" },
				"timeout": { "type": "number", "default": DEFAULT_PACKAGE_TIMEOUT_MS, "description": "Milliseconds before the command is terminated." }
			},
			"required": ["command", "args"]
		}
	}),
	]
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::guard::Sandbox;
	use crate::process::CommandPolicy;

	fn config_for(root: &std::path::Path) -> Config {
		Config {
			sandbox: Sandbox::new(&[root.to_string_lossy().to_string()], root).expect("sandbox"),
			policy: CommandPolicy::standard(),
			otel_enabled: false,
			otel_endpoint: String::new(),
			otel_service_name: String::new(),
			session_id: "test".to_string()
		}
	}

	fn text_of(result: &Value) -> &str {
		result["content"][0]["text"].as_str().unwrap_or("")
	}

	#[test]
	fn definitions_cover_every_tool() {
		let names = tool_definitions()
			.iter()
			.filter_map(|tool| tool["name"].as_str().map(str::to_string))
			.collect::<Vec<_>>();
		assert_eq!(names.len(), 13);
		assert!(names.contains(&"execute_package_manager".to_string()));
		assert!(names.contains(&"list_allowed_directories".to_string()));
	}

	#[tokio::test]
	async fn unknown_tool_is_an_error_result() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let result = call_tool(&config_for(tmp.path()), "delete_everything", &json!({})).await;
		assert_eq!(result["isError"], json!(true));
		assert_eq!(result["structuredContent"]["code"], json!("UNKNOWN_TOOL"));
		assert_eq!(text_of(&result), "Error: Unknown tool: delete_everything");
	}

	#[tokio::test]
	async fn malformed_arguments_name_the_tool() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let result = call_tool(&config_for(tmp.path()), "write_file", &json!({ "path": "a.txt" })).await;
		assert_eq!(result["structuredContent"]["code"], json!("INVALID_ARGUMENTS"));
		assert!(text_of(&result).starts_with("Error: Invalid arguments for write_file:"));
	}

	#[tokio::test]
	async fn search_reports_no_matches() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let result = call_tool(
			&config_for(tmp.path()),
			"search_files",
			&json!({ "path": ".", "pattern": "nothing" })
		).await;
		assert_eq!(text_of(&result), "No matches found");
	}

	#[tokio::test]
	async fn edit_file_returns_fenced_diff() {
		let tmp = tempfile::tempdir().expect("tempdir");
		std::fs::write(tmp.path().join("app.js"), "  foo();\n  bar();\n").expect("write");
		let result = call_tool(
			&config_for(tmp.path()),
			"edit_file",
			&json!({
				"path": "app.js",
				"edits": [{ "oldText": "foo();\nbar();", "newText": "baz();\nqux();" }]
			})
		).await;
		let text = text_of(&result);
		assert!(text.starts_with("```diff\n"));
		assert!(text.contains("+  baz();"));
		assert_eq!(std::fs::read_to_string(tmp.path().join("app.js")).unwrap(), "  baz();\n  qux();\n");
	}

	#[tokio::test]
	async fn package_manager_rejects_publish() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let result = call_tool(
			&config_for(tmp.path()),
			"execute_package_manager",
			&json!({ "command": "npm", "args": ["publish"] })
		).await;
		assert_eq!(result["structuredContent"]["code"], json!("COMMAND_NOT_ALLOWED"));
	}

	#[tokio::test]
	async fn unknown_interpreter_is_rejected_by_arguments() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let result = call_tool(
			&config_for(tmp.path()),
			"execute_file",
			&json!({ "file": "x.rb", "interpreter": "ruby" })
		).await;
		assert_eq!(result["structuredContent"]["code"], json!("INVALID_ARGUMENTS"));
	}
}
