use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use strata::{CallerIdentity, MemoryService};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct StatsCommand {}

impl StatsCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        caller: &CallerIdentity,
        format: OutputFormat,
    ) -> CliResult<()> {
        let report = service.stats(caller)?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["Metric", "Count"]);

                table.add_row(vec!["Pending episodes".to_string(), report.pending_episodes.to_string()]);
                table.add_row(vec!["Consolidated episodes".to_string(), report.consolidated_episodes.to_string()]);
                table.add_row(vec!["Failed episodes".to_string(), report.failed_episodes.to_string()]);
                table.add_row(vec!["Dead-letter episodes".to_string(), report.dead_letter_episodes.to_string()]);
                table.add_row(vec!["Active facts".to_string(), report.active_facts.to_string()]);
                table.add_row(vec!["Fading facts".to_string(), report.fading_facts.to_string()]);
                table.add_row(vec!["Superseded facts".to_string(), report.superseded_facts.to_string()]);
                table.add_row(vec!["Expired facts".to_string(), report.expired_facts.to_string()]);
                table.add_row(vec!["Retracted facts".to_string(), report.retracted_facts.to_string()]);
                table.add_row(vec!["Candidate rules".to_string(), report.candidate_rules.to_string()]);
                table.add_row(vec!["Established rules".to_string(), report.established_rules.to_string()]);
                table.add_row(vec!["Proven rules".to_string(), report.proven_rules.to_string()]);
                table.add_row(vec!["Anti-pattern rules".to_string(), report.anti_pattern_rules.to_string()]);

                println!("{table}");
                if let Some(age) = report.oldest_pending_age_secs {
                    println!("Oldest pending episode: {}s", age);
                }
            }
        }
        Ok(())
    }
}
