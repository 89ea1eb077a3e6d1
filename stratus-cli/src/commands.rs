//! Subcommand handlers.

use chrono::Utc;
use stratus_core::config::PipelineConfig;
use stratus_core::{EntityStatus, RunSummary, ScheduleController, TargetDate};

use crate::{Commands, ConfigAction};

pub async fn handle_command(command: Commands, config: PipelineConfig) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, &config),
        Commands::Run { date } => {
            let controller = build_controller(&config)?;
            let summary = match date {
                Some(d) => controller.backfill(parse_date(&d)?).await,
                None => controller.run_now(Utc::now()).await,
            };
            report(&[summary])
        }
        Commands::Backfill { date, from, to } => {
            let controller = build_controller(&config)?;
            let summaries = match (date, from, to) {
                (Some(d), _, _) => vec![controller.backfill(parse_date(&d)?).await],
                (None, Some(from), Some(to)) => {
                    controller
                        .backfill_range(parse_date(&from)?, parse_date(&to)?)
                        .await?
                }
                _ => anyhow::bail!("backfill needs --date or both --from and --to"),
            };
            report(&summaries)
        }
        Commands::Schedule => {
            let controller = build_controller(&config)?;
            let next = controller.next_fire_after(Utc::now())?;
            println!(
                "Scheduler started ({}). Next fire: {}. Press Ctrl-C to stop.",
                config.schedule.cron, next
            );
            controller
                .run_until_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            println!("Scheduler stopped.");
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, config: &PipelineConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Validate => {
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
            println!(
                "Configuration valid: {} entities ({}), storage at {}",
                config.entities.len(),
                config.entity_names().join(", "),
                config.storage.root.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn build_controller(config: &PipelineConfig) -> anyhow::Result<ScheduleController> {
    let controller = ScheduleController::from_config(config)?;
    if let Some(lock) = controller.lock_path() {
        tracing::debug!(lock = %lock.display(), "Runs serialized through lock file");
    }
    Ok(controller)
}

fn parse_date(s: &str) -> anyhow::Result<TargetDate> {
    s.parse()
        .map_err(|_| anyhow::anyhow!("Invalid date '{}': expected YYYY-MM-DD", s))
}

/// Print each summary; fail when any run had no successful entity.
fn report(summaries: &[RunSummary]) -> anyhow::Result<()> {
    for summary in summaries {
        print_summary(summary);
    }
    let empty: Vec<String> = summaries
        .iter()
        .filter(|s| s.successes == 0)
        .map(|s| s.target_date.to_string())
        .collect();
    if !empty.is_empty() {
        anyhow::bail!("No entity succeeded for {}", empty.join(", "));
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "\nRun {} for {}: {}/{} entities succeeded, {} rows ({} expected), {} ms",
        summary.run_id,
        summary.target_date,
        summary.successes,
        summary.outcomes.len(),
        summary.total_rows,
        summary.expected_total_rows(),
        summary.duration_ms
    );
    for outcome in &summary.outcomes {
        match &outcome.status {
            EntityStatus::Done { rows, .. } => {
                println!("  ✓ {:<20} {:>4} rows", outcome.entity, rows);
            }
            EntityStatus::Failed {
                state, kind, error, ..
            } => {
                println!(
                    "  ✗ {:<20} {} [{}] after {} attempt(s): {}",
                    outcome.entity, state, kind, outcome.attempts, error
                );
            }
        }
    }
    if !summary.row_count_consistent() {
        println!("  ! row count differs from successes x expected rows per entity");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-01-15").unwrap(),
            TargetDate::from_ymd(2024, 1, 15).unwrap()
        );
        assert!(parse_date("15/01/2024").is_err());
    }

    #[test]
    fn test_report_fails_only_when_nothing_succeeded() {
        let date = TargetDate::from_ymd(2024, 1, 15).unwrap();
        let now = Utc::now();
        let empty = RunSummary::finalize(stratus_core::RunId::new(), date, now, now, 0, vec![], 24);
        assert!(report(&[empty]).is_err());
    }
}
