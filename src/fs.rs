use crate::error::SandboxError;
use crate::guard::Sandbox;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use filetime::{set_file_times, FileTime};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::SystemTime;
use tokio::fs;

pub async fn read_file(sandbox: &Sandbox, path: &str) -> Result<String> {
	let valid = sandbox.validate(path)?;
	Ok(fs::read_to_string(&valid).await?)
}

/// Reads run concurrently; a failing path becomes an inline error block.
pub async fn read_multiple_files(sandbox: &Sandbox, paths: &[String]) -> String {
	let reads = paths.iter().map(
		|path| async move {
			match read_file(sandbox, path).await {
				Ok(content) => format!("{}:\n{}\n", path, content),
				Err(err) => format!("{}: Error - {:#}", path, err),
			}
		}
	);
	futures::future::join_all(reads).await.join("\n---\n")
}

pub async fn write_file(sandbox: &Sandbox, path: &str, content: &str) -> Result<()> {
	let valid = sandbox.validate(path)?;
	fs::write(&valid, content).await?;
	Ok(())
}

pub async fn create_directory(sandbox: &Sandbox, path: &str) -> Result<()> {
	let valid = sandbox.validate(path)?;
	fs::create_dir_all(&valid).await?;
	Ok(())
}

pub async fn list_directory(sandbox: &Sandbox, path: &str) -> Result<String> {
	let valid = sandbox.validate(path)?;
	let mut entries = fs::read_dir(&valid).await?;
	let mut lines = Vec::new();
	while let Some(entry) = entries.next_entry().await? {
		let marker = if entry.file_type().await?.is_dir() {
			"[DIR]"
		}
		else {
			"[FILE]"
		};
		lines.push(format!("{} {}", marker, entry.file_name().to_string_lossy()));
	}
	Ok(lines.join("\n"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
	File,
	Directory,
}

#[derive(Debug, Serialize)]
pub struct TreeNode {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: EntryKind,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub children: Option<Vec<TreeNode>>,
}

pub async fn directory_tree(sandbox: &Sandbox, path: &str) -> Result<Vec<TreeNode>> {
	build_tree(sandbox.clone(), PathBuf::from(path)).await
}

/// Each directory is validated again before it is read, so an escape found
/// deep in the tree fails the walk at that node. Symlinks are never followed
/// and show up as `file` entries whatever they point at.
fn build_tree(sandbox: Sandbox, current: PathBuf) -> Pin<Box<dyn Future<Output = Result<Vec<TreeNode>>> + Send>> {
	Box::pin(
		async move {
			let valid = sandbox.validate(&current)?;
			let mut entries = fs::read_dir(&valid).await?;
			let mut nodes = Vec::new();
			while let Some(entry) = entries.next_entry().await? {
				let name = entry.file_name()
					.to_string_lossy()
					.to_string();
				let file_type = entry.file_type().await?;
				let node = if file_type.is_dir() && !file_type.is_symlink() {
					let children = build_tree(sandbox.clone(), valid.join(&name)).await?;
					TreeNode {
						name,
						kind: EntryKind::Directory,
						children: Some(children)
					}
				}
				else {
					TreeNode {
						name,
						kind: EntryKind::File,
						children: None
					}
				};
				nodes.push(node);
			}
			Ok(nodes)
		}
	)
}

pub async fn move_file(sandbox: &Sandbox, source: &str, destination: &str) -> Result<()> {
	let from = sandbox.validate(source)?;
	let to = sandbox.validate(destination)?;
	move_path(&from, &to).await
}

pub async fn move_path(from: &Path, to: &Path) -> Result<()> {
	if fs::symlink_metadata(to).await.is_ok() {
		return Err(SandboxError::DestinationExists {
			path: to.to_path_buf()
		}.into());
	}
	match fs::rename(from, to).await {
		Ok(_) => return Ok(()),
		Err(err) => {
			if !is_cross_device(&err) {
				return Err(err.into());
			}
		}
	}
	tracing::debug!(from = %from.display(), to = %to.display(), "rename crossed devices, copying");
	let meta = fs::metadata(from).await?;
	if meta.is_dir() {
		copy_dir_recursive(from.to_path_buf(), to.to_path_buf()).await?;
		fs::remove_dir_all(from).await?;
	}
	else {
		copy_file_with_meta(from, to).await?;
		fs::remove_file(from).await?;
	}
	Ok(())
}

async fn copy_file_with_meta(from: &Path, to: &Path) -> Result<()> {
	fs::copy(from, to).await?;
	let meta = fs::metadata(from).await?;
	fs::set_permissions(to, meta.permissions()).await?;
	let atime = FileTime::from_last_access_time(&meta);
	let mtime = FileTime::from_last_modification_time(&meta);
	set_file_times(to, atime, mtime)?;
	Ok(())
}

fn copy_dir_recursive(from: PathBuf, to: PathBuf) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
	Box::pin(
		async move {
			fs::create_dir_all(&to).await?;
			let mut entries = fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				let src = entry.path();
				let dst = to.join(entry.file_name());
				let file_type = entry.file_type().await?;
				if file_type.is_symlink() {
					copy_symlink(&src, &dst).await?;
				}
				else if file_type.is_dir() {
					copy_dir_recursive(src, dst).await?;
				}
				else {
					copy_file_with_meta(&src, &dst).await?;
				}
			}
			let meta = fs::metadata(&from).await?;
			fs::set_permissions(&to, meta.permissions()).await?;
			let atime = FileTime::from_last_access_time(&meta);
			let mtime = FileTime::from_last_modification_time(&meta);
			set_file_times(&to, atime, mtime)?;
			Ok(())
		}
	)
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
	let target = fs::read_link(from).await?;
	fs::symlink(target, to).await?;
	Ok(())
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
	copy_file_with_meta(from, to).await
}

fn is_cross_device(err: &std::io::Error) -> bool {
	err.raw_os_error() == Some(libc::EXDEV)
}

/// Case-insensitive substring search over entry names below `root`.
///
/// Entries that fail validation are skipped together with their subtree.
/// Exclude patterns only keep an entry out of the results; the walk still
/// descends into excluded directories.
pub fn search_files(sandbox: &Sandbox, root: &str, pattern: &str, exclude: &[String]) -> Result<Vec<PathBuf>> {
	let root = sandbox.validate(root)?;
	let excludes = build_exclude_set(exclude)?;
	let needle = pattern.to_lowercase();
	let guard = sandbox.clone();
	let mut builder = WalkBuilder::new(&root);
	builder.standard_filters(false);
	builder.follow_links(false);
	builder.filter_entry(move |entry| entry.depth() == 0 || guard.validate(entry.path()).is_ok());
	let mut matches = Vec::new();
	for entry in builder.build() {
		let entry = match entry {
			Ok(entry) => entry,
			Err(err) => {
				tracing::debug!(error = %err, "skipping unreadable entry");
				continue;
			}
		};
		if entry.depth() == 0 {
			continue;
		}
		let path = entry.path();
		if let Some(excludes) = &excludes {
			if excludes.is_match(relative_display(&root, path)) {
				continue;
			}
		}
		let name = entry.file_name()
			.to_string_lossy()
			.to_lowercase();
		if name.contains(&needle) {
			matches.push(path.to_path_buf());
		}
	}
	Ok(matches)
}

fn relative_display(root: &Path, path: &Path) -> String {
	if let Ok(rel) = path.strip_prefix(root) {
		return rel.to_string_lossy().to_string();
	}
	path.to_string_lossy().to_string()
}

/// A bare name excludes every path segment with that name; anything with a
/// wildcard is taken as a glob relative to the search root.
fn build_exclude_set(patterns: &[String]) -> Result<Option<GlobSet>> {
	if patterns.is_empty() {
		return Ok(None);
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let expanded = if pattern.contains('*') {
			pattern.clone()
		}
		else {
			format!("**/{}/**", pattern)
		};
		let glob = GlobBuilder::new(&expanded)
			.literal_separator(true)
			.build()
			.map_err(|err| anyhow!("invalid exclude glob: {}", err))?;
		builder.add(glob);
	}
	Ok(Some(builder.build().map_err(|err| anyhow!("invalid exclude set: {}", err))?))
}

#[derive(Debug)]
pub struct FileInfo {
	pub size: u64,
	pub created: Option<SystemTime>,
	pub modified: Option<SystemTime>,
	pub accessed: Option<SystemTime>,
	pub is_directory: bool,
	pub is_file: bool,
	pub permissions: String,
}

impl FileInfo {
	pub fn to_text(&self) -> String {
		[
			format!("size: {}", self.size),
			format!("created: {}", format_time(self.created)),
			format!("modified: {}", format_time(self.modified)),
			format!("accessed: {}", format_time(self.accessed)),
			format!("isDirectory: {}", self.is_directory),
			format!("isFile: {}", self.is_file),
			format!("permissions: {}", self.permissions),
		].join("\n")
	}
}

pub async fn file_info(sandbox: &Sandbox, path: &str) -> Result<FileInfo> {
	let valid = sandbox.validate(path)?;
	let meta = fs::metadata(&valid).await?;
	Ok(FileInfo {
		size: meta.len(),
		created: meta.created().ok(),
		modified: meta.modified().ok(),
		accessed: meta.accessed().ok(),
		is_directory: meta.is_dir(),
		is_file: meta.is_file(),
		permissions: permission_bits(&meta)
	})
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	use std::os::unix::fs::PermissionsExt;
	format!("{:03o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permission_bits(meta: &std::fs::Metadata) -> String {
	if meta.permissions().readonly() {
		"444".to_string()
	}
	else {
		"666".to_string()
	}
}

fn format_time(time: Option<SystemTime>) -> String {
	match time {
		Some(time) => DateTime::<Utc>::from(time).to_rfc3339(),
		None => "unavailable".to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sandbox_for(root: &Path) -> Sandbox {
		Sandbox::new(&[root.to_string_lossy().to_string()], root).expect("sandbox")
	}

	fn touch(path: &Path) {
		std::fs::create_dir_all(path.parent().unwrap()).expect("parent");
		std::fs::write(path, "x").expect("write");
	}

	fn names(root: &Path, paths: &[PathBuf]) -> Vec<String> {
		let root = root.canonicalize().unwrap();
		let mut out = paths.iter()
			.map(|path| relative_display(&root, path))
			.collect::<Vec<_>>();
		out.sort();
		out
	}

	#[test]
	fn search_is_case_insensitive_on_names() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("README.md"));
		touch(&tmp.path().join("docs/Readme.txt"));
		touch(&tmp.path().join("docs/other.txt"));
		let sandbox = sandbox_for(tmp.path());
		let found = search_files(&sandbox, ".", "readme", &[]).expect("search");
		assert_eq!(names(tmp.path(), &found), vec!["README.md", "docs/Readme.txt"]);
	}

	#[test]
	fn bare_exclude_drops_matching_segments() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("readme.md"));
		touch(&tmp.path().join("node_modules/pkg/readme.md"));
		touch(&tmp.path().join("app/node_modules/dep/README"));
		let sandbox = sandbox_for(tmp.path());
		let found = search_files(&sandbox, ".", "readme", &["node_modules".to_string()]).expect("search");
		assert_eq!(names(tmp.path(), &found), vec!["readme.md"]);
	}

	#[test]
	fn excluded_directory_is_still_descended() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join("build.log/readme.txt"));
		touch(&tmp.path().join("readme.log"));
		let sandbox = sandbox_for(tmp.path());
		let found = search_files(&sandbox, ".", "readme", &["*.log".to_string()]).expect("search");
		assert_eq!(names(tmp.path(), &found), vec!["build.log/readme.txt"]);
	}

	#[test]
	fn dotfiles_match_exclude_globs() {
		let tmp = tempfile::tempdir().expect("tempdir");
		touch(&tmp.path().join(".hidden/notes.md"));
		touch(&tmp.path().join("notes.md"));
		let sandbox = sandbox_for(tmp.path());
		let found = search_files(&sandbox, ".", "notes", &[".hidden/*".to_string()]).expect("search");
		assert_eq!(names(tmp.path(), &found), vec!["notes.md"]);
	}

	#[cfg(unix)]
	#[test]
	fn search_skips_escaping_symlinks() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let outside = tempfile::tempdir().expect("outside");
		touch(&outside.path().join("match.txt"));
		std::os::unix::fs::symlink(outside.path().join("match.txt"), tmp.path().join("match-link.txt")).expect("symlink");
		touch(&tmp.path().join("match.md"));
		let sandbox = sandbox_for(tmp.path());
		let found = search_files(&sandbox, ".", "match", &[]).expect("search");
		assert_eq!(names(tmp.path(), &found), vec!["match.md"]);
	}

	#[tokio::test]
	async fn tree_marks_files_and_empty_directories() {
		let tmp = tempfile::tempdir().expect("tempdir");
		std::fs::create_dir(tmp.path().join("subdir")).expect("subdir");
		touch(&tmp.path().join("file.txt"));
		let sandbox = sandbox_for(tmp.path());
		let tree = directory_tree(&sandbox, ".").await.expect("tree");
		let value = serde_json::to_value(&tree).expect("json");
		let nodes = value.as_array().expect("array");
		assert_eq!(nodes.len(), 2);
		assert!(nodes.contains(&serde_json::json!({ "name": "subdir", "type": "directory", "children": [] })));
		assert!(nodes.contains(&serde_json::json!({ "name": "file.txt", "type": "file" })));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn tree_reports_symlinked_directories_as_files() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let outside = tempfile::tempdir().expect("outside");
		let target = outside.path().join("private");
		touch(&target.join("secret.txt"));
		std::os::unix::fs::symlink(&target, tmp.path().join("escape")).expect("symlink");
		std::fs::create_dir(tmp.path().join("inner")).expect("inner");
		std::os::unix::fs::symlink(tmp.path().join("inner"), tmp.path().join("alias")).expect("symlink");
		let sandbox = sandbox_for(tmp.path());
		let tree = directory_tree(&sandbox, ".").await.expect("tree");
		let value = serde_json::to_value(&tree).expect("json");
		let nodes = value.as_array().expect("array");
		assert_eq!(nodes.len(), 3);
		assert!(nodes.contains(&serde_json::json!({ "name": "escape", "type": "file" })));
		assert!(nodes.contains(&serde_json::json!({ "name": "alias", "type": "file" })));
		assert!(nodes.contains(&serde_json::json!({ "name": "inner", "type": "directory", "children": [] })));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn directory_copy_keeps_symlinks() {
		let tmp = tempfile::tempdir().expect("tempdir");
		let src = tmp.path().join("src");
		touch(&src.join("data.txt"));
		std::os::unix::fs::symlink("data.txt", src.join("link.txt")).expect("symlink");
		let dst = tmp.path().join("dst");
		copy_dir_recursive(src.clone(), dst.clone()).await.expect("copy");
		let meta = std::fs::symlink_metadata(dst.join("link.txt")).expect("meta");
		assert!(meta.file_type().is_symlink());
		assert_eq!(std::fs::read_link(dst.join("link.txt")).expect("readlink"), PathBuf::from("data.txt"));
		assert_eq!(std::fs::read_to_string(dst.join("data.txt")).expect("read"), "x");
	}

	#[tokio::test]
	async fn move_refuses_existing_destination() {
		let tmp = tempfile::tempdir().expect("tempdir");
		std::fs::write(tmp.path().join("a.txt"), "a").expect("write");
		std::fs::write(tmp.path().join("b.txt"), "b").expect("write");
		let sandbox = sandbox_for(tmp.path());
		let err = move_file(&sandbox, "a.txt", "b.txt").await.unwrap_err();
		assert_eq!(err.downcast_ref::<SandboxError>().map(SandboxError::code), Some("DESTINATION_EXISTS"));
		assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "a");
		assert_eq!(std::fs::read_to_string(tmp.path().join("b.txt")).unwrap(), "b");
		move_file(&sandbox, "a.txt", "c.txt").await.expect("move");
		assert!(!tmp.path().join("a.txt").exists());
		assert_eq!(std::fs::read_to_string(tmp.path().join("c.txt")).unwrap(), "a");
	}

	#[tokio::test]
	async fn read_multiple_isolates_failures() {
		let tmp = tempfile::tempdir().expect("tempdir");
		std::fs::write(tmp.path().join("one.txt"), "alpha").expect("write");
		let sandbox = sandbox_for(tmp.path());
		let paths = vec!["one.txt".to_string(), "missing.txt".to_string(), "/etc/passwd".to_string()];
		let text = read_multiple_files(&sandbox, &paths).await;
		let blocks = text.split("\n---\n").collect::<Vec<_>>();
		assert_eq!(blocks.len(), 3);
		assert_eq!(blocks[0], "one.txt:\nalpha\n");
		assert!(blocks[1].starts_with("missing.txt: Error - "));
		assert!(blocks[2].starts_with("/etc/passwd: Error - Access denied"));
	}

	#[tokio::test]
	async fn list_and_info_describe_entries() {
		let tmp = tempfile::tempdir().expect("tempdir");
		std::fs::create_dir(tmp.path().join("dir")).expect("dir");
		std::fs::write(tmp.path().join("f.txt"), "hello").expect("write");
		let sandbox = sandbox_for(tmp.path());
		let mut lines = list_directory(&sandbox, ".").await.expect("list")
			.lines()
			.map(str::to_string)
			.collect::<Vec<_>>();
		lines.sort();
		assert_eq!(lines, vec!["[DIR] dir", "[FILE] f.txt"]);
		let info = file_info(&sandbox, "f.txt").await.expect("info");
		assert_eq!(info.size, 5);
		assert!(info.is_file);
		assert!(!info.is_directory);
		assert_eq!(info.permissions.len(), 3);
		let text = info.to_text();
		assert!(text.contains("size: 5"));
		assert!(text.contains("isFile: true"));
	}
}
