use crate::error::SandboxError;
use anyhow::{anyhow, Context, Result};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

/// A configured root in both its nominal and symlink-resolved forms.
#[derive(Clone, Debug)]
pub struct AllowedRoot {
	pub path: PathBuf,
	pub path_canon: PathBuf,
}

/// The directory allow-list. Built once at startup and only read afterwards.
#[derive(Clone, Debug)]
pub struct Sandbox {
	roots: Vec<AllowedRoot>,
	cwd: PathBuf,
}

impl Sandbox {
	/// Every entry must name an existing directory, otherwise the sandbox
	/// cannot be established and the caller is expected to abort.
	pub fn new(dirs: &[String], cwd: &Path) -> Result<Self> {
		if dirs.is_empty() {
			return Err(anyhow!("Usage: mcp-secure-fs <allowed-directory> [additional-directories...]"));
		}
		let mut roots: Vec<AllowedRoot> = Vec::new();
		for dir in dirs {
			let path = absolutize(&expand_home(Path::new(dir)), cwd);
			let meta = std::fs::metadata(&path).with_context(|| format!("Error accessing directory {}", dir))?;
			if !meta.is_dir() {
				return Err(anyhow!("Error: {} is not a directory", dir));
			}
			let path_canon = path.canonicalize().with_context(|| format!("Error accessing directory {}", dir))?;
			if roots.iter().any(|root| root.path == path) {
				continue;
			}
			roots.push(AllowedRoot {
				path,
				path_canon
			});
		}
		Ok(Self {
			roots,
			cwd: cwd.to_path_buf()
		})
	}

	pub fn roots(&self) -> &[AllowedRoot] {
		&self.roots
	}

	pub fn cwd(&self) -> &Path {
		&self.cwd
	}

	/// Resolve `requested` and confirm it stays inside an allowed root.
	///
	/// Existing targets come back as their real path. A target that does not
	/// exist yet is accepted when its parent resolves inside a root, and is
	/// returned in normalized absolute form.
	pub fn validate(&self, requested: impl AsRef<Path>) -> Result<PathBuf> {
		let normalized = absolutize(&expand_home(requested.as_ref()), &self.cwd);
		if !self.nominally_allowed(&normalized) {
			return Err(SandboxError::AccessDenied {
				path: normalized,
				reason: "path outside allowed directories"
			}.into());
		}
		match normalized.canonicalize() {
			Ok(real) => {
				if !self.really_allowed(&real) {
					return Err(SandboxError::AccessDenied {
						path: normalized,
						reason: "symlink target outside allowed directories"
					}.into());
				}
				Ok(real)
			}
			Err(err) if err.kind() == ErrorKind::NotFound => self.validate_new_entry(normalized),
			Err(err) => Err(anyhow::Error::new(err).context(format!("cannot resolve {}", normalized.display()))),
		}
	}

	fn validate_new_entry(&self, normalized: PathBuf) -> Result<PathBuf> {
		if let Ok(meta) = std::fs::symlink_metadata(&normalized) {
			if meta.file_type().is_symlink() {
				return Err(SandboxError::AccessDenied {
					path: normalized,
					reason: "symlink target does not exist"
				}.into());
			}
		}
		let Some(parent) = normalized.parent() else {
			return Err(SandboxError::ParentMissing {
				parent: normalized
			}.into());
		};
		let real_parent = match parent.canonicalize() {
			Ok(real_parent) => real_parent,
			Err(_) => {
				return Err(SandboxError::ParentMissing {
					parent: parent.to_path_buf()
				}.into());
			}
		};
		if !self.really_allowed(&real_parent) {
			return Err(SandboxError::AccessDenied {
				path: normalized,
				reason: "parent directory outside allowed directories"
			}.into());
		}
		Ok(normalized)
	}

	fn nominally_allowed(&self, path: &Path) -> bool {
		self.roots
			.iter()
			.any(|root| path.starts_with(&root.path) || path.starts_with(&root.path_canon))
	}

	fn really_allowed(&self, path: &Path) -> bool {
		let normalized = normalize_path(path);
		self.roots
			.iter()
			.any(|root| normalized.starts_with(&root.path_canon) || normalized.starts_with(&root.path))
	}
}

pub fn expand_home(path: &Path) -> PathBuf {
	if let Ok(rest) = path.strip_prefix("~") {
		if let Some(home) = dirs::home_dir() {
			return home.join(rest);
		}
	}
	path.to_path_buf()
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
	if path.is_absolute() {
		normalize_path(path)
	}
	else {
		normalize_path(&cwd.join(path))
	}
}

/// Lexical normalization: drops `.`, folds `..`, never touches the disk.
pub fn normalize_path(path: &Path) -> PathBuf {
	let mut stack: Vec<OsString> = Vec::new();
	let mut prefix: Option<OsString> = None;
	let mut absolute = false;
	for component in path.components() {
		match component {
			Component::Prefix(prefix_component) => {
				prefix = Some(prefix_component.as_os_str().to_os_string());
			}
			Component::RootDir => {
				absolute = true;
				stack.clear();
			}
			Component::CurDir => {}
			Component::ParentDir => {
				if matches!(stack.last(), Some(last) if last != "..") {
					stack.pop();
				}
				else if !absolute {
					stack.push(OsString::from(".."));
				}
			}
			Component::Normal(part) => stack.push(part.to_os_string()),
		}
	}
	let mut out = PathBuf::new();
	if let Some(prefix) = prefix {
		out.push(prefix);
	}
	if absolute {
		out.push(Path::new(std::path::MAIN_SEPARATOR_STR));
	}
	for part in stack {
		out.push(part);
	}
	out
}
