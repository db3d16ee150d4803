use crate::guard::Sandbox;
use crate::process::CommandPolicy;
use crate::protocol::{Request, Response, INVALID_PARAMS, METHOD_NOT_FOUND, PARSE_ERROR};
use crate::tools;
use anyhow::{anyhow, Context, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_semantic_conventions::resource as semconv;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const SERVER_NAME: &str = "secure-filesystem-server";
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Clone, Debug)]
pub struct Config {
	pub sandbox: Sandbox,
	pub policy: &'static CommandPolicy,
	pub otel_enabled: bool,
	pub otel_endpoint: String,
	pub otel_service_name: String,
	pub session_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	allowed_directories: Vec<String>,
	#[serde(default)]
	otel: Option<FileOtelConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileOtelConfig {
	enabled: Option<bool>,
	endpoint: Option<String>,
	service_name: Option<String>,
}

pub fn load_config() -> Result<Config> {
	let cwd = std::env::current_dir()?;
	let args = std::env::args().skip(1).collect::<Vec<_>>();
	build_config(args, &|key: &str| std::env::var(key).ok(), cwd)
}

/// Layering, lowest first: config file, environment, command line. Root
/// lists from all three are concatenated.
fn build_config(args: Vec<String>, env: &dyn Fn(&str) -> Option<String>, cwd: PathBuf) -> Result<Config> {
	let mut cli_roots: Vec<String> = Vec::new();
	let mut config_path: Option<String> = None;
	let mut cli_otel_enabled: Option<bool> = None;
	let mut cli_otel_endpoint: Option<String> = None;
	let mut cli_otel_service_name: Option<String> = None;
	let mut args = args.into_iter();
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => {
				let value = args.next().ok_or_else(|| anyhow!("--config requires a value"))?;
				config_path = Some(value);
			}
			"--otel-enabled" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-enabled requires a value"))?;
				cli_otel_enabled = Some(parse_bool(&value, "--otel-enabled")?);
			}
			"--otel-endpoint" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-endpoint requires a value"))?;
				cli_otel_endpoint = Some(value);
			}
			"--otel-service-name" => {
				let value = args.next().ok_or_else(|| anyhow!("--otel-service-name requires a value"))?;
				cli_otel_service_name = Some(value);
			}
			"--" => {
				cli_roots.extend(args.by_ref());
			}
			flag if flag.starts_with("--") => return Err(anyhow!("unknown argument: {}", flag)),
			_ => cli_roots.push(arg),
		}
	}
	if config_path.is_none() {
		config_path = non_empty(env("MCP_CONFIG"));
	}
	let file = match &config_path {
		Some(path) => load_file_config(&resolve_against(path, &cwd))?,
		None => FileConfig::default(),
	};
	let file_otel = file.otel.unwrap_or_default();
	let mut otel_enabled = file_otel.enabled.unwrap_or(false);
	let mut otel_endpoint = file_otel.endpoint.unwrap_or_else(|| String::from("http://127.0.0.1:4317"));
	let mut otel_service_name = file_otel.service_name.unwrap_or_else(|| String::from("mcp-secure-fs"));
	if let Some(value) = non_empty(env("MCP_OTEL_ENABLED")) {
		otel_enabled = parse_bool(&value, "MCP_OTEL_ENABLED")?;
	}
	if let Some(value) = non_empty(env("MCP_OTEL_ENDPOINT")) {
		otel_endpoint = value;
	}
	if let Some(value) = non_empty(env("MCP_OTEL_SERVICE_NAME")) {
		otel_service_name = value;
	}
	otel_enabled = cli_otel_enabled.unwrap_or(otel_enabled);
	otel_endpoint = cli_otel_endpoint.unwrap_or(otel_endpoint);
	otel_service_name = cli_otel_service_name.unwrap_or(otel_service_name);
	let mut roots = cli_roots;
	if let Some(env_roots) = env("MCP_ALLOWED_ROOTS") {
		roots.extend(
			env_roots.split(',')
				.map(str::trim)
				.filter(|value| !value.is_empty())
				.map(str::to_string)
		);
	}
	roots.extend(file.allowed_directories);
	let sandbox = Sandbox::new(&roots, &cwd)?;
	Ok(Config {
		sandbox,
		policy: CommandPolicy::standard(),
		otel_enabled,
		otel_endpoint,
		otel_service_name,
		session_id: uuid::Uuid::new_v4().to_string()
	})
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
	let text = std::fs::read_to_string(path).with_context(|| format!("cannot read config {}", path.display()))?;
	serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

fn resolve_against(path: &str, cwd: &Path) -> PathBuf {
	let path = Path::new(path);
	if path.is_absolute() {
		path.to_path_buf()
	}
	else {
		cwd.join(path)
	}
}

fn non_empty(value: Option<String>) -> Option<String> {
	value.filter(|value| !value.trim().is_empty())
}

fn parse_bool(value: &str, label: &str) -> Result<bool> {
	let value = value.trim().to_lowercase();
	match value.as_str() {
		"1" | "true" | "yes" | "on" => Ok(true),
		"0" | "false" | "no" | "off" => Ok(false),
		_ => Err(anyhow!("{} must be a boolean", label)),
	}
}

/// Logs go to stderr; stdout belongs to the protocol.
pub fn init_tracing(config: &Config) {
	let _ = global::set_error_handler(|_| {});
	let resource = Resource::new(
		vec![
		opentelemetry::KeyValue::new(semconv::SERVICE_NAME, config.otel_service_name.clone()),
		opentelemetry::KeyValue::new(semconv::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
		opentelemetry::KeyValue::new("mcp.session_id", config.session_id.clone()),
		opentelemetry::KeyValue::new("mcp.allowed_roots", config.sandbox.roots().len() as i64),
		]
	);
	let tracing_layer = if config.otel_enabled {
		let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(config.otel_endpoint.clone());
		let provider = opentelemetry_otlp::new_pipeline()
			.tracing()
			.with_exporter(exporter)
			.with_trace_config(sdktrace::Config::default().with_resource(resource))
			.install_batch(opentelemetry_sdk::runtime::Tokio)
			.ok();
		if let Some(provider) = provider {
			let tracer = provider.tracer(config.otel_service_name.clone());
			global::set_tracer_provider(provider);
			Some(OpenTelemetryLayer::new(tracer))
		}
		else {
			None
		}
	}
	else {
		None
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_target(false)
		.with_writer(std::io::stderr);
	let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if let Some(layer) = tracing_layer {
		subscriber.with(layer).init();
	}
	else {
		subscriber.init();
	}
}

pub async fn run(config: Config) -> Result<()> {
	let allowed = config.sandbox
		.roots()
		.iter()
		.map(|root| root.path.display().to_string())
		.collect::<Vec<_>>();
	info!(session_id = %config.session_id, "Secure MCP Filesystem Server running on stdio");
	info!(directories = ?allowed, "Allowed directories");
	let stdin = io::stdin();
	let stdout = io::stdout();
	let mut reader = BufReader::new(stdin);
	let mut writer = io::BufWriter::new(stdout);
	let mut raw = Vec::new();
	loop {
		raw.clear();
		if reader.read_until(b'\n', &mut raw).await? == 0 {
			break;
		}
		let line = match std::str::from_utf8(&raw) {
			Ok(line) => line,
			Err(err) => {
				warn!(error = %err, "request is not valid UTF-8");
				let resp = Response::err(Value::Null, PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if line.trim().is_empty() {
			continue;
		}
		let req: Request = match serde_json::from_str(line) {
			Ok(req) => req,
			Err(err) => {
				warn!(error = %err, "unparseable request");
				let resp = Response::err(Value::Null, PARSE_ERROR, err.to_string());
				write_response(&mut writer, resp).await?;
				continue;
			}
		};
		if let Some(resp) = handle_request(&config, req).await {
			write_response(&mut writer, resp).await?;
		}
	}
	info!("stdin closed, shutting down");
	Ok(())
}

pub async fn handle_request(config: &Config, req: Request) -> Option<Response> {
	let method = req.method.clone();
	let tool_name = extract_tool_name(&method, &req.params);
	let span = info_span!(
		"mcp.request",
		"mcp.session_id" = %config.session_id,
		"mcp.method" = %method,
		"mcp.tool_name" = tool_name.as_deref().unwrap_or(""),
		"mcp.is_error" = tracing::field::Empty,
		"mcp.error_code" = tracing::field::Empty,
		"mcp.response_bytes" = tracing::field::Empty,
	);
	if req.is_notification() {
		span.in_scope(|| tracing::debug!("notification received"));
		return None;
	}
	let id = req.id.clone().unwrap_or(Value::Null);
	let outcome = route(config, &req).instrument(span.clone()).await;
	Some(match outcome {
		Ok(value) => {
			record_result(&span, &value);
			Response::ok(id, value)
		}
		Err((code, message)) => {
			span.in_scope(|| warn!(code, message = %message, "request failed"));
			Response::err(id, code, message)
		}
	})
}

async fn route(config: &Config, req: &Request) -> std::result::Result<Value, (i64, String)> {
	match req.method.as_str() {
		"initialize" => Ok(json!({
			"protocolVersion": PROTOCOL_VERSION,
			"serverInfo": {
				"name": SERVER_NAME,
				"version": env!("CARGO_PKG_VERSION")
			},
			"capabilities": {
				"tools": {}
			}
		})),
		"ping" => Ok(json!({})),
		"tools/list" => Ok(json!({
			"tools": tools::tool_definitions(),
		})),
		"tools/call" => {
			let name = req.params
				.get("name")
				.and_then(Value::as_str)
				.ok_or_else(|| (INVALID_PARAMS, "name is required".to_string()))?;
			let arguments = req.params
				.get("arguments")
				.cloned()
				.unwrap_or_else(|| json!({}));
			Ok(tools::call_tool(config, name, &arguments).await)
		}
		_ => Err((METHOD_NOT_FOUND, "method not found".to_string())),
	}
}

fn extract_tool_name(method: &str, params: &Value) -> Option<String> {
	if method != "tools/call" {
		return None;
	}
	params.get("name")
		.and_then(Value::as_str)
		.map(|value| value.to_string())
}

fn record_result(span: &Span, result: &Value) {
	let response_bytes = serde_json::to_string(result).map(|value| value.len() as u64).ok();
	if let Some(bytes) = response_bytes {
		span.record("mcp.response_bytes", bytes);
	}
	let is_error = result.get("isError")
		.and_then(Value::as_bool)
		.unwrap_or(false);
	span.record("mcp.is_error", is_error);
	if let Some(code) = result.get("structuredContent")
		.and_then(|value| value.get("code"))
		.and_then(Value::as_str) {
		span.record("mcp.error_code", code);
	}
}

async fn write_response(writer: &mut io::BufWriter<io::Stdout>, resp: Response) -> Result<()> {
	let line = serde_json::to_string(&resp)?;
	writer.write_all(line.as_bytes()).await?;
	writer.write_all(b"\n").await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
		let map = pairs.iter()
			.map(|(key, value)| (key.to_string(), value.to_string()))
			.collect::<HashMap<_, _>>();
		move |key: &str| map.get(key).cloned()
	}

	fn args(items: &[&str]) -> Vec<String> {
		items.iter().map(|item| item.to_string()).collect()
	}

	fn text(path: &Path) -> String {
		path.to_string_lossy().to_string()
	}

	#[test]
	fn positional_and_env_roots_are_combined() {
		let one = tempfile::tempdir().expect("one");
		let two = tempfile::tempdir().expect("two");
		let two_path = text(two.path());
		let env = env_from(&[("MCP_ALLOWED_ROOTS", two_path.as_str())]);
		let config = build_config(vec![text(one.path())], &env, PathBuf::from("/")).expect("config");
		let roots = config.sandbox
			.roots()
			.iter()
			.map(|root| root.path.clone())
			.collect::<Vec<_>>();
		assert_eq!(roots, vec![one.path().to_path_buf(), two.path().to_path_buf()]);
		assert!(!config.otel_enabled);
	}

	#[test]
	fn missing_roots_fail_fast() {
		let env = env_from(&[]);
		let err = build_config(Vec::new(), &env, PathBuf::from("/")).unwrap_err();
		assert!(err.to_string().starts_with("Usage:"));
		let err = build_config(args(&["/definitely/not/here"]), &env, PathBuf::from("/")).unwrap_err();
		assert!(err.to_string().contains("/definitely/not/here"));
	}

	#[test]
	fn unknown_flags_are_rejected() {
		let env = env_from(&[]);
		let err = build_config(args(&["--bogus"]), &env, PathBuf::from("/")).unwrap_err();
		assert_eq!(err.to_string(), "unknown argument: --bogus");
	}

	#[test]
	fn command_line_beats_env_and_file() {
		let root = tempfile::tempdir().expect("root");
		let extra = tempfile::tempdir().expect("extra");
		let config_file = root.path().join("config.json");
		let body = json!({
			"allowed_directories": [extra.path()],
			"otel": { "enabled": true, "endpoint": "http://file:4317", "service_name": "from-file" }
		});
		std::fs::write(&config_file, body.to_string()).expect("write config");
		let env = env_from(&[("MCP_OTEL_ENDPOINT", "http://env:4317")]);
		let config = build_config(
			vec![
				"--config".to_string(),
				text(&config_file),
				"--otel-service-name".to_string(),
				"from-cli".to_string(),
				text(root.path()),
			],
			&env,
			PathBuf::from("/")
		).expect("config");
		assert!(config.otel_enabled);
		assert_eq!(config.otel_endpoint, "http://env:4317");
		assert_eq!(config.otel_service_name, "from-cli");
		assert_eq!(config.sandbox.roots().len(), 2);
	}

	#[test]
	fn bool_flags_accept_common_spellings() {
		assert!(parse_bool("Yes", "x").unwrap());
		assert!(!parse_bool("0", "x").unwrap());
		assert!(parse_bool("maybe", "x").is_err());
	}

	#[tokio::test]
	async fn notifications_get_no_response() {
		let root = tempfile::tempdir().expect("root");
		let env = env_from(&[]);
		let config = build_config(vec![text(root.path())], &env, PathBuf::from("/")).expect("config");
		let req: Request = serde_json::from_value(json!({ "method": "notifications/initialized" })).expect("parse");
		assert!(handle_request(&config, req).await.is_none());
		let req: Request = serde_json::from_value(json!({ "id": 1, "method": "nope" })).expect("parse");
		let resp = handle_request(&config, req).await.expect("response");
		assert_eq!(resp.error.map(|err| err.code), Some(METHOD_NOT_FOUND));
	}
}
