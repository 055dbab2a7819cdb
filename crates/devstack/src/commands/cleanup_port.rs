use anyhow::Result;
use comfy_table::{Cell, Color, Table};
use service_orchestration::{CleanupResult, EngineConfig, Orchestrator};

pub async fn run(port: u16) -> Result<()> {
    let engine = Orchestrator::new(EngineConfig::default())?;
    let result = engine.cleanup_port(port).await?;

    if result.found == 0 {
        println!("Nothing is listening on port {}", port);
        return Ok(());
    }
    println!("{}", table(&result));
    println!(
        "Port {}: found {}, killed {}, {} error(s)",
        port,
        result.found,
        result.killed,
        result.errors.len()
    );
    if !result.is_clean() {
        anyhow::bail!("Port {} could not be fully reclaimed", port);
    }
    Ok(())
}

fn table(result: &CleanupResult) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["PID", "RESULT"]);
    for pid in &result.pids {
        let row = match result.errors.iter().find(|e| e.pid == *pid) {
            Some(error) => vec![
                Cell::new(pid),
                Cell::new(&error.message).fg(Color::Red),
            ],
            None => vec![Cell::new(pid), Cell::new("killed").fg(Color::Green)],
        };
        table.add_row(row);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_orchestration::PidError;

    #[test]
    fn test_table_marks_failures() {
        let result = CleanupResult {
            port: 8080,
            found: 2,
            killed: 1,
            pids: vec![10, 20],
            errors: vec![PidError {
                pid: 20,
                message: "Operation not permitted".into(),
            }],
        };
        let rendered = table(&result).to_string();
        assert!(rendered.contains("killed"));
        assert!(rendered.contains("Operation not permitted"));
    }
}
