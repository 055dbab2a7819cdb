use super::{format_duration, load_stack, persistent_engine, service_id};
use anyhow::Result;
use comfy_table::Table;
use std::path::Path;
use std::time::Duration;

pub async fn run(
    config_path: &Path,
    data_dir: &Path,
    service: &str,
    window_secs: u64,
    json: bool,
) -> Result<()> {
    let stack = load_stack(config_path)?;
    let id = service_id(&stack, service)?;
    let engine = persistent_engine(&stack, data_dir).await?;

    let window = Duration::from_secs(window_secs);
    let stats = engine.stats(id, window)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["METRIC", "VALUE"]);
    table.add_row(vec!["window".to_string(), format_duration(stats.window)]);
    table.add_row(vec![
        "uptime".to_string(),
        format!("{:.2}%", stats.uptime_percent),
    ]);
    table.add_row(vec!["downtime".to_string(), format_duration(stats.total_downtime)]);
    table.add_row(vec![
        "mtbf".to_string(),
        if stats.mtbf.is_zero() {
            "-".to_string()
        } else {
            format_duration(stats.mtbf)
        },
    ]);
    table.add_row(vec!["restarts".to_string(), stats.total_restarts.to_string()]);
    table.add_row(vec![
        "last downtime".to_string(),
        stats
            .last_downtime
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
    ]);

    println!("{}", service);
    println!("{}", table);
    Ok(())
}
