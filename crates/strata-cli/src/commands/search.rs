use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use strata::memory::types::EntityKind;
use strata::retrieval::{ScoredItem, SearchMode, SearchOptions};
use strata::token::HeuristicTokenizer;
use strata::{CallerIdentity, MemoryService};

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct SearchCommand {
    #[clap(help = "Query text")]
    pub query: String,

    #[clap(long, help = "Restrict to a memory type (episode, fact, rule); repeatable")]
    pub kind: Vec<String>,

    #[clap(long, default_value = "hybrid", help = "Ranking mode (semantic, keyword, hybrid)")]
    pub mode: String,

    #[clap(long, help = "Visibility scope (defaults to global only)")]
    pub scope: Option<String>,

    #[clap(long, default_value = "10", help = "Maximum results")]
    pub limit: usize,

    #[clap(long, help = "Drop items below this effective confidence")]
    pub min_confidence: Option<f64>,
}

impl SearchCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        caller: &CallerIdentity,
        format: OutputFormat,
    ) -> CliResult<()> {
        let kinds = self
            .kind
            .iter()
            .map(|k| EntityKind::parse(k))
            .collect::<Result<Vec<_>, _>>()?;
        let options = SearchOptions {
            kinds,
            scope: self.scope.clone(),
            mode: SearchMode::parse(&self.mode)?,
            limit: self.limit,
            min_confidence: self.min_confidence,
        };

        let results = service.search(caller, &self.query, &options)?;
        print_results(&results, format)
    }
}

#[derive(Parser)]
pub struct RecallCommand {
    #[clap(help = "Topic to recall facts and rules for")]
    pub topic: String,

    #[clap(long, help = "Visibility scope (defaults to global only)")]
    pub scope: Option<String>,

    #[clap(long, default_value = "10", help = "Maximum results")]
    pub limit: usize,

    #[clap(long, help = "Drop items below this effective confidence")]
    pub min_confidence: Option<f64>,
}

impl RecallCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        caller: &CallerIdentity,
        format: OutputFormat,
    ) -> CliResult<()> {
        let results = service.recall(
            caller,
            &self.topic,
            self.scope.as_deref(),
            self.limit,
            self.min_confidence,
        )?;
        print_results(&results, format)
    }
}

#[derive(Parser)]
pub struct ContextCommand {
    #[clap(help = "Session trigger text, e.g. the task description")]
    pub trigger: String,

    #[clap(long, default_value = "cli", help = "Session source for recent-episode lookup")]
    pub source: String,

    #[clap(long, help = "Token budget override")]
    pub budget: Option<usize>,
}

impl ContextCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        caller: &CallerIdentity,
        format: OutputFormat,
    ) -> CliResult<()> {
        let tokenizer = HeuristicTokenizer;
        let block = service.context(caller, &self.trigger, &self.source, self.budget, &tokenizer)?;

        match format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "text": block.text,
                    "token_count": block.token_count,
                    "fact_count": block.fact_count,
                    "rule_count": block.rule_count,
                    "episode_count": block.episode_count,
                });
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
            OutputFormat::Table => {
                print!("{}", block.text);
                eprintln!(
                    "({} tokens: {} facts, {} rules, {} episodes)",
                    block.token_count, block.fact_count, block.rule_count, block.episode_count
                );
            }
        }
        Ok(())
    }
}

fn print_results(results: &[ScoredItem], format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = results
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "type": r.item.kind().as_str(),
                        "id": r.item.id(),
                        "score": r.score,
                        "confidence": r.confidence,
                        "content": r.item.content(),
                        "created_at": r.item.created_at(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            if results.is_empty() {
                println!("No results.");
                return Ok(());
            }
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["Type", "Score", "Conf", "Content", "Created", "Id"]);
            for result in results {
                table.add_row(vec![
                    result.item.kind().as_str().to_string(),
                    format!("{:.3}", result.score),
                    format!("{:.2}", result.confidence),
                    truncate_string(result.item.content(), 60),
                    format_timestamp(&result.item.created_at()),
                    result.item.id().to_string(),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}
