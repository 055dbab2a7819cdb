//! Command type for building executable commands

use async_process::Command as AsyncCommand;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// A command to be executed
///
/// Unlike `async_process::Command` this type is `Clone`, can be inspected
/// after construction and is turned into a runnable command only when it is
/// launched. Environment entries are kept sorted so two commands built from
/// the same inputs compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    current_dir: Option<PathBuf>,
    env_clear: bool,
    own_process_group: bool,
}

impl Command {
    /// Create a new command for the given program
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            env_clear: false,
            own_process_group: true,
        }
    }

    /// Shorthand for `sh -c <script>`
    pub fn shell(script: impl AsRef<OsStr>) -> Self {
        let mut cmd = Self::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    /// Add an argument to the command
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Add multiple arguments to the command
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
        self
    }

    /// Set an environment variable
    pub fn env<K, V>(&mut self, key: K, val: V) -> &mut Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.env
            .insert(key.as_ref().to_owned(), val.as_ref().to_owned());
        self
    }

    /// Set multiple environment variables
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (key, val) in vars {
            self.env(key, val);
        }
        self
    }

    /// Clear the inherited environment (explicitly set vars still apply)
    pub fn env_clear(&mut self) -> &mut Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory for the command
    pub fn current_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.current_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Keep the child in the launcher's process group.
    ///
    /// By default every launched command leads its own group so the whole
    /// tree (build tool plus the JVM/node process it forks) can be signalled
    /// at once.
    pub fn inherit_process_group(&mut self) -> &mut Self {
        self.own_process_group = false;
        self
    }

    /// Get the program name
    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    /// Get the arguments
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Get the environment variables
    pub fn get_envs(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    /// Get the current directory
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Whether the child will lead its own process group
    pub fn has_own_process_group(&self) -> bool {
        self.own_process_group
    }

    /// Human readable `program arg arg` form for logs
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Convert into an `async_process::Command` ready to spawn
    pub(crate) fn prepare(&self) -> AsyncCommand {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd.args(&self.args);

        if self.env_clear {
            std_cmd.env_clear();
        }
        std_cmd.envs(&self.env);

        if let Some(dir) = &self.current_dir {
            std_cmd.current_dir(dir);
        }

        #[cfg(unix)]
        if self.own_process_group {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        AsyncCommand::from(std_cmd)
    }
}
