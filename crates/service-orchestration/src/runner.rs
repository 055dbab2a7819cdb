//! Turning a service definition into a launch command

use process_launcher::Command;
use service_registry::{BuildSystem, Service};
use std::path::Path;

use crate::Result;

/// Builds the command that runs a service from its working directory
pub trait BuildRunner: Send + Sync {
    /// Command for `service`, to be run in `work_dir`
    fn command(&self, service: &Service, work_dir: &Path) -> Result<Command>;
}

/// Runs each build system's usual "run in dev mode" goal.
///
/// Project-local wrappers (`mvnw`, `gradlew`) are preferred when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBuildRunner;

impl BuildRunner for DefaultBuildRunner {
    fn command(&self, service: &Service, work_dir: &Path) -> Result<Command> {
        let cmd = match &service.build {
            BuildSystem::Maven => {
                let mut cmd = if work_dir.join("mvnw").is_file() {
                    Command::new("./mvnw")
                } else {
                    Command::new("mvn")
                };
                cmd.arg("spring-boot:run");
                cmd
            }
            BuildSystem::Gradle => {
                let mut cmd = if work_dir.join("gradlew").is_file() {
                    Command::new("./gradlew")
                } else {
                    Command::new("gradle")
                };
                cmd.arg("bootRun");
                cmd
            }
            BuildSystem::Npm => {
                let mut cmd = Command::new("npm");
                cmd.arg("start");
                cmd
            }
            BuildSystem::Cargo => {
                let mut cmd = Command::new("cargo");
                cmd.arg("run");
                cmd
            }
            BuildSystem::Shell { command } => Command::shell(command),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_preferred_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let service = Service::new("api", dir.path(), BuildSystem::Maven);

        let cmd = DefaultBuildRunner.command(&service, dir.path()).unwrap();
        assert_eq!(cmd.display(), "mvn spring-boot:run");

        std::fs::write(dir.path().join("mvnw"), "#!/bin/sh\n").unwrap();
        let cmd = DefaultBuildRunner.command(&service, dir.path()).unwrap();
        assert_eq!(cmd.display(), "./mvnw spring-boot:run");
    }

    #[test]
    fn test_shell_command_passthrough() {
        let service = Service::new(
            "worker",
            "worker",
            BuildSystem::Shell {
                command: "python -m worker".into(),
            },
        );
        let cmd = DefaultBuildRunner.command(&service, Path::new(".")).unwrap();
        assert_eq!(cmd.display(), "sh -c python -m worker");
    }
}
