use super::{load_stack, persistent_engine, service_id};
use anyhow::Result;
use process_launcher::LogSource;
use service_registry::LogQuery;
use std::path::Path;

pub async fn run(config_path: &Path, data_dir: &Path, service: &str, query: LogQuery) -> Result<()> {
    let stack = load_stack(config_path)?;
    let id = service_id(&stack, service)?;
    let engine = persistent_engine(&stack, data_dir).await?;

    let lines = engine.stored_logs(id, &query).await?;
    if lines.is_empty() {
        println!("No captured output for {}", service);
        return Ok(());
    }
    for line in lines {
        let stream = match line.source {
            LogSource::Stdout => "out",
            LogSource::Stderr => "err",
        };
        println!(
            "{} {} {:<5} {}",
            line.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            stream,
            format!("{:?}", line.level).to_uppercase(),
            line.line
        );
    }
    Ok(())
}
