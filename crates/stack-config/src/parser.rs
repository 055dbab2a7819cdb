//! Stack file parsing, validation and conversion to registry definitions

use crate::{
    BuildKind, ConfigError, DependsOn, ProfileSpec, Result, ServiceSpec, Stack, StackFile,
    resolver::{ResolutionContext, resolve_env, resolve_string},
};
use service_registry::{
    BuildSystem, DependencyEdge, DependencyGraph, GraphIssue, Profile, ProfileIndex, Service,
    service_id_for_name,
};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Supported stack file version
pub const SUPPORTED_VERSION: &str = "1.0";

/// Parse and validate a stack file.
///
/// Relative `settings.projects_dir` and profile directories resolve
/// against the file's own directory.
pub fn parse_file(path: impl AsRef<Path>) -> Result<StackFile> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let mut stack = parse_str(&content)?;

    if let Some(base) = path.parent() {
        if let Some(dir) = stack.settings.projects_dir.take() {
            stack.settings.projects_dir = Some(base.join(dir));
        }
        for profile in stack.profiles.values_mut() {
            if let Some(dir) = profile.projects_dir.take() {
                profile.projects_dir = Some(base.join(dir));
            }
        }
    }
    debug!(
        "Parsed {} with {} service(s) and {} profile(s)",
        path.display(),
        stack.services.len(),
        stack.profiles.len()
    );
    Ok(stack)
}

/// Parse and validate a stack file from a string
pub fn parse_str(content: &str) -> Result<StackFile> {
    let stack: StackFile = serde_yaml::from_str(content)?;
    validate(&stack)?;
    Ok(stack)
}

/// Structural validation: version, names, references, cycles and settings
pub fn validate(stack: &StackFile) -> Result<()> {
    if stack.version != SUPPORTED_VERSION {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}, expected {}",
            stack.version, SUPPORTED_VERSION
        )));
    }
    stack
        .settings
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

    for (name, service) in &stack.services {
        validate_service(stack, name, service)?;
    }

    for (name, profile) in &stack.profiles {
        for member in &profile.services {
            if !stack.services.contains_key(member) {
                return Err(ConfigError::ValidationError(format!(
                    "Profile '{}' references unknown service '{}'",
                    name, member
                )));
            }
        }
    }

    let services = convert_services(stack, &ResolutionContext::isolated(), false)?;
    let graph = DependencyGraph::new(services.iter());
    if let Some(GraphIssue::Cycle { ids }) = graph
        .validate(None)
        .into_iter()
        .find(|issue| matches!(issue, GraphIssue::Cycle { .. }))
    {
        let names: Vec<&str> = ids.iter().filter_map(|id| graph.name_of(id)).collect();
        return Err(ConfigError::ValidationError(format!(
            "Dependency cycle between {}",
            names.join(", ")
        )));
    }
    Ok(())
}

fn validate_service(stack: &StackFile, name: &str, service: &ServiceSpec) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "Service names must not be empty".into(),
        ));
    }
    match (service.build, &service.command) {
        (BuildKind::Shell, None) => {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' has no build tool and no command",
                name
            )));
        }
        (BuildKind::Shell, Some(_)) | (_, None) => {}
        (kind, Some(_)) => {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' sets a command with build tool {:?}",
                name, kind
            )));
        }
    }
    if service.port == Some(0) {
        return Err(ConfigError::ValidationError(format!(
            "Service '{}' has port 0",
            name
        )));
    }

    for dep in &service.depends_on {
        let target = dep.target();
        if target == name {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' depends on itself",
                name
            )));
        }
        if !stack.services.contains_key(target) {
            return Err(ConfigError::ValidationError(format!(
                "Service '{}' depends on unknown service '{}'",
                name, target
            )));
        }
    }
    Ok(())
}

fn build_system(spec: &ServiceSpec) -> BuildSystem {
    match (spec.build, &spec.command) {
        (BuildKind::Maven, _) => BuildSystem::Maven,
        (BuildKind::Gradle, _) => BuildSystem::Gradle,
        (BuildKind::Npm, _) => BuildSystem::Npm,
        (BuildKind::Cargo, _) => BuildSystem::Cargo,
        (BuildKind::Shell, command) => BuildSystem::Shell {
            command: command.clone().unwrap_or_default(),
        },
    }
}

fn edge(from: &str, dep: &DependsOn) -> DependencyEdge {
    let from = service_id_for_name(from);
    match dep {
        DependsOn::Name(target) => DependencyEdge::new(from, service_id_for_name(target)),
        DependsOn::Detailed {
            service,
            required,
            healthy,
            wait_secs,
        } => {
            let mut edge = DependencyEdge::new(from, service_id_for_name(service));
            edge.required = *required;
            edge.health_check_required = *healthy;
            if let Some(secs) = wait_secs {
                edge = edge.with_wait(Duration::from_secs(*secs));
            }
            edge
        }
    }
}

fn convert_services(
    stack: &StackFile,
    context: &ResolutionContext,
    substitute: bool,
) -> Result<Vec<Service>> {
    stack
        .services
        .iter()
        .map(|(name, spec)| {
            let mut service = Service::new(name.as_str(), spec.directory.clone(), build_system(spec))
                .with_order(spec.order);
            service.port = spec.port;
            service.health_url = spec.health_url.clone();
            service.env = if substitute {
                resolve_env(&spec.env, context)?
            } else {
                spec.env.clone()
            };
            if substitute {
                if let Some(url) = &service.health_url {
                    service.health_url = Some(resolve_string(url, context)?);
                }
            }
            service.dependencies = spec.depends_on.iter().map(|dep| edge(name, dep)).collect();
            Ok(service)
        })
        .collect()
}

fn convert_profile(name: &str, spec: &ProfileSpec, context: &ResolutionContext) -> Result<Profile> {
    Ok(Profile {
        name: name.to_string(),
        service_ids: spec
            .services
            .iter()
            .map(|s| service_id_for_name(s))
            .collect(),
        projects_dir: spec.projects_dir.clone(),
        env: resolve_env(&spec.env, context)?,
    })
}

impl StackFile {
    /// Convert to engine inputs using the process environment
    pub fn resolve(&self) -> Result<Stack> {
        self.resolve_with(&ResolutionContext::new())
    }

    /// Convert to engine inputs with an explicit substitution context
    pub fn resolve_with(&self, context: &ResolutionContext) -> Result<Stack> {
        let mut settings = self.settings.clone();
        settings.env = resolve_env(&settings.env, context)?;

        let services = convert_services(self, context, true)?;
        let mut profiles = ProfileIndex::new();
        for (name, spec) in &self.profiles {
            profiles.insert(convert_profile(name, spec, context)?);
        }
        Ok(Stack {
            settings,
            services,
            profiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: "1.0"
services:
  db:
    directory: db
    command: ./run.sh
"#;

    #[test]
    fn test_minimal_stack_uses_default_settings() {
        let stack = parse_str(MINIMAL).unwrap();
        assert_eq!(stack.settings, service_orchestration::EngineConfig::default());
        assert_eq!(stack.services["db"].build, BuildKind::Shell);
        assert!(stack.profiles.is_empty());
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let yaml = MINIMAL.replace("1.0", "2.0");
        assert!(matches!(
            parse_str(&yaml),
            Err(ConfigError::ValidationError(msg)) if msg.contains("Unsupported version")
        ));
    }

    #[test]
    fn test_rejects_shell_without_command() {
        let yaml = r#"
version: "1.0"
services:
  db:
    directory: db
"#;
        assert!(matches!(parse_str(yaml), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_command_with_build_tool() {
        let yaml = r#"
version: "1.0"
services:
  api:
    directory: api
    build: maven
    command: ./mvnw
"#;
        assert!(matches!(parse_str(yaml), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_edge_conversion() {
        let full = edge(
            "api",
            &DependsOn::Detailed {
                service: "db".into(),
                required: false,
                healthy: true,
                wait_secs: Some(90),
            },
        );
        assert_eq!(full.from, service_id_for_name("api"));
        assert_eq!(full.to, service_id_for_name("db"));
        assert!(!full.required);
        assert!(full.health_check_required);
        assert_eq!(full.wait(), Some(Duration::from_secs(90)));

        let bare = edge("api", &DependsOn::Name("db".into()));
        assert!(bare.required);
        assert!(!bare.health_check_required);
        assert_eq!(bare.wait(), None);
    }
}
