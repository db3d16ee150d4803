use crate::error::SandboxError;
use anyhow::Result;
use serde::Deserialize;
use similar::TextDiff;
use std::path::Path;

/// One search/replace pair from an `edit_file` request.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
	pub old_text: String,
	pub new_text: String,
}

/// Apply `edits` in order to the file at `path` and return the fenced diff.
/// Nothing is written unless every edit lands and `dry_run` is false.
pub async fn apply_file_edits(path: &Path, edits: &[EditOperation], dry_run: bool) -> Result<String> {
	let original = normalize_line_endings(&tokio::fs::read_to_string(path).await?);
	let updated = apply_edits(&original, edits)?;
	let diff = unified_diff(&original, &updated, &path.display().to_string());
	let fenced = fence_diff(&diff);
	if !dry_run {
		tokio::fs::write(path, &updated).await?;
	}
	Ok(fenced)
}

/// Pure edit application against already loaded content.
pub fn apply_edits(content: &str, edits: &[EditOperation]) -> Result<String> {
	let mut current = normalize_line_endings(content);
	for edit in edits {
		let old_text = normalize_line_endings(&edit.old_text);
		let new_text = normalize_line_endings(&edit.new_text);
		if current.contains(&old_text) {
			current = current.replacen(&old_text, &new_text, 1);
			continue;
		}
		match fuzzy_replace(&current, &old_text, &new_text) {
			Some(next) => current = next,
			None => {
				return Err(SandboxError::NoMatch {
					old_text: edit.old_text.clone()
				}.into());
			}
		}
	}
	Ok(current)
}

fn normalize_line_endings(text: &str) -> String {
	text.replace("\r\n", "\n")
}

/// Line-window match ignoring surrounding whitespace; first window wins.
fn fuzzy_replace(content: &str, old_text: &str, new_text: &str) -> Option<String> {
	let old_lines: Vec<&str> = old_text.split('\n').collect();
	let mut content_lines: Vec<String> = content.split('\n').map(str::to_string).collect();
	if old_lines.len() > content_lines.len() {
		return None;
	}
	let start = (0..=content_lines.len() - old_lines.len()).find(
		|&start| {
			old_lines.iter()
				.zip(&content_lines[start..])
				.all(|(old, line)| old.trim() == line.trim())
		}
	)?;
	let matched = &content_lines[start..start + old_lines.len()];
	let replacement = reindent(matched, &old_lines, new_text);
	content_lines.splice(start..start + old_lines.len(), replacement);
	Some(content_lines.join("\n"))
}

fn reindent(matched: &[String], old_lines: &[&str], new_text: &str) -> Vec<String> {
	let last = old_lines.len().saturating_sub(1);
	new_text.split('\n')
		.enumerate()
		.map(
			|(index, line)| {
				let body = line.trim_start();
				if body.is_empty() {
					return String::new();
				}
				let pair = index.min(last);
				let base = leading_whitespace(&matched[pair]);
				if index == 0 {
					return format!("{}{}", base, body);
				}
				let extra = leading_whitespace(line).len()
					.saturating_sub(leading_whitespace(old_lines[pair]).len());
				format!("{}{}{}", base, " ".repeat(extra), body)
			})
		.collect()
}

fn leading_whitespace(line: &str) -> &str {
	&line[..line.len() - line.trim_start().len()]
}

/// Git-style unified diff with `original`/`modified` labels.
pub fn unified_diff(original: &str, updated: &str, label: &str) -> String {
	let diff = TextDiff::from_lines(original, updated);
	let body = diff.unified_diff()
		.context_radius(3)
		.header(&format!("{}\toriginal", label), &format!("{}\tmodified", label))
		.to_string();
	format!("Index: {}\n{}\n{}", label, "=".repeat(67), body)
}

/// Wrap `diff` in a backtick fence longer than any backtick run inside it.
pub fn fence_diff(diff: &str) -> String {
	let mut ticks = 3;
	while diff.contains(&"`".repeat(ticks)) {
		ticks += 1;
	}
	let fence = "`".repeat(ticks);
	format!("{}diff\n{}{}\n\n", fence, diff, fence)
}
