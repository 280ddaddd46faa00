use std::sync::Arc;

use clap::Parser;
use strata::MemoryService;
use strata::config::Config;
use strata::consolidation::{ConsolidationPipeline, RemoteExtractor};
use strata::embedding::Embedder;
use strata::sweep::{DecaySweep, EpisodeCleanup};

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct SweepCommand {
    #[clap(long, help = "Skip the episode TTL/capacity cleanup pass")]
    pub decay_only: bool,
}

impl SweepCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        config: &Config,
        format: OutputFormat,
    ) -> CliResult<()> {
        let store = service.store().clone();
        let decay = DecaySweep::new(store.clone(), &config.decay).run()?;
        let cleanup = if self.decay_only {
            None
        } else {
            Some(EpisodeCleanup::new(store, &config.storage).run()?)
        };

        match format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "facts_checked": decay.facts_checked,
                    "facts_faded": decay.facts_faded,
                    "facts_expired": decay.facts_expired,
                    "facts_revived": decay.facts_revived,
                    "rules_checked": decay.rules_checked,
                    "rules_demoted": decay.rules_demoted,
                    "episodes_expired": cleanup.as_ref().map(|c| c.expired_deleted),
                    "episodes_evicted": cleanup.as_ref().map(|c| c.capacity_deleted),
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Table => {
                println!(
                    "Decay: {} facts checked, {} faded, {} expired, {} revived",
                    decay.facts_checked, decay.facts_faded, decay.facts_expired, decay.facts_revived
                );
                println!(
                    "Rules: {} checked, {} demoted",
                    decay.rules_checked, decay.rules_demoted
                );
                if let Some(cleanup) = cleanup {
                    println!(
                        "Episodes: {} expired, {} evicted over capacity",
                        cleanup.expired_deleted, cleanup.capacity_deleted
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Parser)]
pub struct ConsolidateCommand {}

impl ConsolidateCommand {
    pub async fn execute(
        &self,
        service: &MemoryService,
        embedder: Arc<dyn Embedder>,
        config: &Config,
        format: OutputFormat,
    ) -> CliResult<()> {
        let agent = Arc::new(RemoteExtractor::new(&config.extractor)?);
        let pipeline = ConsolidationPipeline::new(
            service.store().clone(),
            embedder,
            agent,
            config.consolidation.clone(),
        );
        let report = pipeline.run().await?;

        match format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "groups_processed": report.groups_processed,
                    "groups_failed": report.groups_failed,
                    "episodes_consolidated": report.episodes_consolidated,
                    "episodes_failed": report.episodes_failed,
                    "episodes_dead_lettered": report.episodes_dead_lettered,
                    "facts_created": report.facts_created,
                    "rules_created": report.rules_created,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Table => {
                println!(
                    "Groups: {} processed, {} failed",
                    report.groups_processed, report.groups_failed
                );
                println!(
                    "Episodes: {} consolidated, {} failed, {} dead-lettered",
                    report.episodes_consolidated,
                    report.episodes_failed,
                    report.episodes_dead_lettered
                );
                println!(
                    "Created: {} facts, {} rules",
                    report.facts_created, report.rules_created
                );
            }
        }
        Ok(())
    }
}
