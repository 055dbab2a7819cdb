//! Subcommands and the helpers they share

pub mod cleanup_port;
pub mod logs;
pub mod order;
pub mod stats;
pub mod up;
pub mod validate;

use anyhow::{Context, Result, bail};
use service_orchestration::Orchestrator;
use service_registry::{
    DependencyGraph, ProfileContext, RecordStore, Retention, ServiceId, SledStore,
};
use stack_config::{Stack, parser};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// `<local data dir>/devstack`, or `./.devstack` when there is none
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("devstack"))
        .unwrap_or_else(|| PathBuf::from(".devstack"))
}

/// Parse, validate and resolve a stack file
pub fn load_stack(config_path: &Path) -> Result<Stack> {
    let file = parser::parse_file(config_path)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;
    file.resolve().context("Failed to resolve stack file")
}

/// Engine without persistence, for read-only planning commands
pub async fn planning_engine(stack: &Stack) -> Result<Orchestrator> {
    let engine = Orchestrator::new(stack.settings.clone())?;
    engine.add_services(stack.services.clone()).await?;
    Ok(engine)
}

/// Engine backed by the sled store under `data_dir`, with persisted state loaded
pub async fn persistent_engine(stack: &Stack, data_dir: &Path) -> Result<Orchestrator> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create {}", data_dir.display()))?;
    let path = data_dir.join("state");
    let retention = Retention {
        uptime_per_service: stack.settings.uptime_capacity,
        ..Retention::default()
    };
    let store = SledStore::open(&path, retention).with_context(|| {
        format!(
            "Failed to open {} (is another devstack running?)",
            path.display()
        )
    })?;
    let store: Arc<dyn RecordStore> = Arc::new(store);

    let engine = Orchestrator::builder(stack.settings.clone())
        .store(store)
        .build()?;
    let loaded = engine.load().await?;
    debug!("Loaded {} persisted service(s) from {}", loaded, path.display());
    Ok(engine)
}

/// Make the engine's registry match the stack file
pub async fn sync_registry(engine: &Orchestrator, stack: &Stack) -> Result<()> {
    let wanted: BTreeSet<ServiceId> = stack.services.iter().map(|s| s.id).collect();
    for view in engine.services() {
        if !wanted.contains(&view.service.id) {
            info!("Removing {} which is no longer in the stack file", view.service.name);
            engine.delete_service(view.service.id, true).await?;
        }
    }

    // Clear edges first so intermediate states cannot form cycles
    let mut fresh = Vec::new();
    for service in &stack.services {
        if engine.service(service.id).is_ok() {
            engine.set_dependencies(service.id, Vec::new()).await?;
        } else {
            let mut bare = service.clone();
            bare.dependencies.clear();
            fresh.push(bare);
        }
    }
    engine.add_services(fresh).await?;
    for service in &stack.services {
        engine.update_service(service.clone()).await?;
    }
    Ok(())
}

/// Scope for a command: the profile (if any) narrowed to the named services
/// plus everything they depend on
pub fn scope(stack: &Stack, services: &[String], profile: Option<&str>) -> Result<ProfileContext> {
    let mut ctx = match profile {
        Some(name) => stack
            .profiles
            .context(name)
            .with_context(|| format!("Profile '{}' not found", name))?,
        None => ProfileContext::all(),
    };
    if services.is_empty() {
        return Ok(ctx);
    }

    let mut ids = Vec::new();
    for name in services {
        let service = stack.service(name)?;
        if !ctx.includes(&service.id) {
            bail!("Service '{}' is not part of the selected profile", name);
        }
        ids.push(service.id);
    }
    let graph = DependencyGraph::new(stack.services.iter());
    ctx.service_ids = Some(graph.with_dependencies(ids));
    Ok(ctx)
}

/// Look up a service name in the stack file
pub fn service_id(stack: &Stack, name: &str) -> Result<ServiceId> {
    Ok(stack.service(name)?.id)
}

/// Compact duration for tables, e.g. `2h 5m 3s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m {s}s"),
        _ => format!("{h}h {m}m {s}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
version: "1.0"
services:
  db:
    directory: db
    command: exec sleep 30
  api:
    directory: api
    command: exec sleep 30
    depends_on: [db]
  web:
    directory: web
    command: exec sleep 30
    depends_on: [api]
  docs:
    directory: docs
    command: exec sleep 30
profiles:
  backend:
    services: [db, api]
"#;

    fn stack(yaml: &str) -> Stack {
        parser::parse_str(yaml).unwrap().resolve().unwrap()
    }

    #[test]
    fn test_scope_pulls_in_dependencies() {
        let stack = stack(STACK);
        let ctx = scope(&stack, &["web".into()], None).unwrap();
        let ids = ctx.service_ids.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&service_id(&stack, "docs").unwrap()));

        let all = scope(&stack, &[], None).unwrap();
        assert!(all.service_ids.is_none());
    }

    #[test]
    fn test_scope_respects_profile() {
        let stack = stack(STACK);
        let ctx = scope(&stack, &[], Some("backend")).unwrap();
        assert_eq!(ctx.service_ids.as_ref().map(|s| s.len()), Some(2));

        assert!(scope(&stack, &["web".into()], Some("backend")).is_err());
        assert!(scope(&stack, &[], Some("missing")).is_err());
        assert!(scope(&stack, &["ghost".into()], None).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7503)), "2h 5m 3s");
    }

    #[test]
    fn test_sync_registry_follows_stack_file() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let first = stack(STACK);
            let engine = persistent_engine(&first, dir.path()).await.unwrap();
            sync_registry(&engine, &first).await.unwrap();
            assert_eq!(engine.services().len(), 4);
            drop(engine);

            // docs removed, api now depends on nothing, db depends on api
            let second = stack(
                r#"
version: "1.0"
services:
  db:
    directory: db
    command: exec sleep 30
    depends_on: [api]
  api:
    directory: api
    command: exec sleep 30
  web:
    directory: web
    command: exec sleep 30
    depends_on: [api]
"#,
            );
            let engine = persistent_engine(&second, dir.path()).await.unwrap();
            assert_eq!(engine.services().len(), 4);
            sync_registry(&engine, &second).await.unwrap();

            let names: Vec<String> = engine
                .order(None)
                .unwrap()
                .into_iter()
                .map(|id| engine.service(id).unwrap().service.name)
                .collect();
            assert_eq!(names.len(), 3);
            assert_eq!(names[0], "api");
        });
    }
}
