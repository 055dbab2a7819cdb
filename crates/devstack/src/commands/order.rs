use super::{load_stack, planning_engine, scope};
use anyhow::Result;
use std::path::Path;

pub async fn run(config_path: &Path, services: Vec<String>, profile: Option<String>) -> Result<()> {
    let stack = load_stack(config_path)?;
    let ctx = scope(&stack, &services, profile.as_deref())?;
    let engine = planning_engine(&stack).await?;

    for (i, id) in engine.order(ctx.service_ids.as_ref())?.into_iter().enumerate() {
        let view = engine.service(id)?;
        let deps: Vec<String> = view
            .service
            .dependency_ids()
            .filter_map(|dep| engine.service(dep).ok())
            .map(|dep| dep.service.name)
            .collect();
        if deps.is_empty() {
            println!("{:>3}. {}", i + 1, view.service.name);
        } else {
            println!("{:>3}. {} (after {})", i + 1, view.service.name, deps.join(", "));
        }
    }
    Ok(())
}
