use super::{load_stack, persistent_engine, scope, sync_registry};
use anyhow::{Context, Result};
use async_channel::Receiver;
use comfy_table::{Cell, Color, Table};
use service_orchestration::{BatchReport, Error as EngineError, Outcome};
use service_registry::{ChangeKind, HealthStatus, ServiceChangeEvent};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::Path;
use tracing::{info, warn};

pub async fn run(
    config_path: &Path,
    data_dir: &Path,
    services: Vec<String>,
    profile: Option<String>,
) -> Result<()> {
    let stack = load_stack(config_path)?;
    let ctx = scope(&stack, &services, profile.as_deref())?;
    let engine = persistent_engine(&stack, data_dir).await?;
    sync_registry(&engine, &stack).await?;

    let interrupts = interrupts()?;
    let subscription = engine.subscribe();
    let printer = smol::spawn(async move {
        while let Some(event) = subscription.recv().await {
            print_event(&event);
        }
    });

    let in_scope = engine.order(ctx.service_ids.as_ref())?.len();
    println!("Starting {} service(s)... (Ctrl-C to stop)", in_scope);

    let started = smol::future::or(
        async { Some(engine.start_all(&ctx).await) },
        async {
            let _ = interrupts.recv().await;
            None
        },
    )
    .await;

    match started {
        Some(Ok(report)) => {
            print_report(&report);
            println!("All services started. Press Ctrl-C to stop.");
            let _ = interrupts.recv().await;
        }
        Some(Err(EngineError::PartialBatchFailure(report))) => {
            print_report(&report);
            warn!("{}", report.summary());
            println!("Some services failed; the rest keep running. Press Ctrl-C to stop.");
            let _ = interrupts.recv().await;
        }
        Some(Err(e)) => {
            engine.shutdown().await?;
            return Err(e).context("Failed to start services");
        }
        None => println!("\nInterrupted during start"),
    }

    info!("Shutting down");
    println!("\nStopping services...");
    let report = engine.shutdown().await?;
    print_report(&report);
    drop(printer);
    Ok(())
}

/// SIGINT/SIGTERM delivered through a channel
fn interrupts() -> Result<Receiver<i32>> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
    let (tx, rx) = async_channel::bounded(1);
    smol::unblock(move || {
        for signal in signals.forever() {
            // A second signal while shutdown runs is dropped
            let _ = tx.try_send(signal);
            if tx.is_closed() {
                break;
            }
        }
    })
    .detach();
    Ok(rx)
}

fn print_event(event: &ServiceChangeEvent) {
    let time = event.timestamp.format("%H:%M:%S");
    match event.kind {
        ChangeKind::StatusChanged { from, to } => {
            println!("{} {:<20} {} -> {}", time, event.service_name, from, to)
        }
        ChangeKind::HealthChanged { to, .. } if to != HealthStatus::Unknown => {
            println!("{} {:<20} {}", time, event.service_name, to)
        }
        _ => {}
    }
}

fn status_color(outcome: &Outcome) -> Color {
    match outcome {
        Outcome::Started { .. } | Outcome::Stopped { forced: false } => Color::Green,
        Outcome::AlreadyRunning | Outcome::AlreadyStopped => Color::DarkGrey,
        Outcome::Stopped { forced: true } | Outcome::Skipped => Color::Yellow,
        Outcome::Failed { .. } => Color::Red,
    }
}

fn print_report(report: &BatchReport) {
    let mut table = Table::new();
    table.set_header(vec!["SERVICE", "OUTCOME", "DETAIL"]);
    for entry in &report.outcomes {
        let (label, detail) = match &entry.outcome {
            Outcome::Started { pid } => ("started", format!("pid {}", pid)),
            Outcome::AlreadyRunning => ("running", String::new()),
            Outcome::Stopped { forced } => (
                "stopped",
                if *forced { "SIGKILL".into() } else { String::new() },
            ),
            Outcome::AlreadyStopped => ("stopped", "was not running".into()),
            Outcome::Failed { error } => ("failed", error.clone()),
            Outcome::Skipped => ("skipped", "earlier start failed".into()),
        };
        table.add_row(vec![
            Cell::new(&entry.name),
            Cell::new(label).fg(status_color(&entry.outcome)),
            Cell::new(detail),
        ]);
    }
    println!("{}", table);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_colors() {
        assert_eq!(status_color(&Outcome::Started { pid: 1 }), Color::Green);
        assert_eq!(status_color(&Outcome::Stopped { forced: true }), Color::Yellow);
        assert_eq!(
            status_color(&Outcome::Failed {
                error: "boom".into()
            }),
            Color::Red
        );
    }
}
