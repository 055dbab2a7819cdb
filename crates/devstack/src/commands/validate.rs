use super::{load_stack, planning_engine};
use anyhow::{Context, Result, bail};
use service_registry::GraphIssue;
use stack_config::{ConfigError, parser};
use std::path::Path;

pub async fn run(config_path: &Path) -> Result<()> {
    println!("Validating {}...", config_path.display());

    let file = parser::parse_file(config_path).context("Failed to parse configuration")?;
    println!("✓ Configuration valid");
    println!("  Version: {}", file.version);
    if let Some(name) = &file.name {
        println!("  Name: {}", name);
    }
    println!("  Services: {}", file.services.len());
    println!("  Profiles: {}", file.profiles.len());

    // Missing variables are reported, not fatal, until something starts
    let stack = match load_stack(config_path) {
        Ok(stack) => stack,
        Err(e) => match e.downcast_ref::<ConfigError>() {
            Some(ConfigError::EnvVarNotFound(vars)) => {
                println!("  ⚠ Undefined environment variables: {}", vars);
                return Ok(());
            }
            _ => return Err(e),
        },
    };

    let engine = planning_engine(&stack).await?;
    let issues = engine.validate(None);
    if !issues.is_empty() {
        for issue in &issues {
            match issue {
                GraphIssue::MissingTarget { from, to } => {
                    println!("  ✗ {} depends on unknown service {}", from, to)
                }
                GraphIssue::Cycle { ids } => println!("  ✗ dependency cycle over {:?}", ids),
            }
        }
        bail!("{} dependency problem(s)", issues.len());
    }

    let names = |ids: &[service_registry::ServiceId]| -> Vec<String> {
        ids.iter()
            .filter_map(|id| engine.service(*id).ok())
            .map(|view| view.service.name)
            .collect()
    };
    println!("\nStart order: {}", names(&engine.order(None)?).join(" -> "));
    println!("Tiers:");
    for (i, tier) in engine.tiers(None)?.iter().enumerate() {
        println!("  {}: {}", i, names(tier).join(", "));
    }
    Ok(())
}
