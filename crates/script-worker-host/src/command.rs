//! Host command line building and executable resolution.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Base command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Base command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let executable = resolve_executable_path(&program)
            .await
            .ok_or(CommandBuildError::ExecutableNotFound(program))?;
        Ok((executable, args))
    }
}

/// Builder for the command line that starts a host interpreter.
///
/// The base is parsed with shell quoting rules, so `"python3 -u host.py"`
/// becomes a program plus two arguments.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Base executable command.
    pub base: String,
    /// Optional parameters to append.
    pub params: Option<Vec<String>>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Set parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Extend parameters.
    #[must_use]
    pub fn extend_params<I>(mut self, more: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let extra: Vec<String> = more.into_iter().map(Into::into).collect();
        match &mut self.params {
            Some(p) => p.extend(extra),
            None => self.params = Some(extra),
        }
        self
    }

    /// Split into program and arguments.
    ///
    /// # Errors
    /// Returns error if the base cannot be parsed or is empty.
    pub fn build(&self) -> Result<CommandParts, CommandBuildError> {
        let mut parts = split_command_line(&self.base)?;
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }

        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}

fn split_command_line(input: &str) -> Result<Vec<String>, CommandBuildError> {
    #[cfg(windows)]
    {
        Ok(winsplit::split(input))
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))
    }
}

/// Resolve an executable by name.
///
/// Explicit paths (absolute, or containing a separator) are used as-is when
/// they point at a file; bare names are looked up on `PATH`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
