//! Token-budgeted context assembly
//!
//! Builds the formatted memory block injected into an agent's prompt at
//! session start. Sections appear in fixed order (facts, rules, recent
//! episodes) and items are admitted highest-score-first until the token
//! budget would be exceeded.

use tracing::debug;

use crate::config::ContextConfig;
use crate::error::Result;
use crate::memory::types::EntityKind;
use crate::retrieval::{Retriever, ScoreWeights, ScoredItem};
use crate::token::TokenCounter;

const FACTS_HEADER: &str = "## Known facts";
const RULES_HEADER: &str = "## Learned rules";
const EPISODES_HEADER: &str = "## Recent episodes";

/// An assembled, budget-bounded context block.
#[derive(Debug, Clone)]
pub struct ContextBlock {
    /// Rendered markdown text
    pub text: String,
    /// Tokens consumed, as measured by the assembly tokenizer
    pub token_count: usize,
    pub fact_count: usize,
    pub rule_count: usize,
    pub episode_count: usize,
}

/// Assembles context blocks from recall results.
pub struct ContextAssembler<'a> {
    retriever: &'a Retriever,
    tokenizer: &'a dyn TokenCounter,
    config: ContextConfig,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        retriever: &'a Retriever,
        tokenizer: &'a dyn TokenCounter,
        config: ContextConfig,
    ) -> Self {
        Self {
            retriever,
            tokenizer,
            config,
        }
    }

    /// Assemble a context block for a trigger text. `source` selects
    /// which episodes are eligible for the recent-episodes section.
    pub fn assemble(
        &self,
        tenant: &str,
        trigger: &str,
        source: &str,
        token_budget: Option<usize>,
    ) -> Result<ContextBlock> {
        let budget = token_budget.unwrap_or(self.config.token_budget);

        // Over-fetch per section; the budget walk below trims.
        let recalled = self.retriever.recall(
            tenant,
            trigger,
            None,
            self.config.max_facts + self.config.max_rules,
            &ScoreWeights::default(),
            None,
        )?;
        let facts: Vec<&ScoredItem> = recalled
            .iter()
            .filter(|r| r.item.kind() == EntityKind::Fact)
            .take(self.config.max_facts)
            .collect();
        let rules: Vec<&ScoredItem> = recalled
            .iter()
            .filter(|r| r.item.kind() == EntityKind::Rule)
            .take(self.config.max_rules)
            .collect();
        let episodes = if self.config.max_episodes > 0 {
            self.retriever.recent_episodes(tenant, source, self.config.max_episodes)?
        } else {
            Vec::new()
        };

        let mut text = String::new();
        let mut used = 0usize;

        let fact_lines: Vec<String> = facts.iter().map(|r| render_fact(r)).collect();
        let fact_count = self.admit_section(&mut text, &mut used, budget, FACTS_HEADER, &fact_lines);

        let rule_lines: Vec<String> = rules.iter().map(|r| render_rule(r)).collect();
        let rule_count = self.admit_section(&mut text, &mut used, budget, RULES_HEADER, &rule_lines);

        let episode_lines: Vec<String> = episodes
            .iter()
            .map(|e| format!("- {}\n", e.content.trim()))
            .collect();
        let episode_count =
            self.admit_section(&mut text, &mut used, budget, EPISODES_HEADER, &episode_lines);

        debug!(tenant, budget, used, fact_count, rule_count, episode_count, "context assembled");
        Ok(ContextBlock {
            text,
            token_count: used,
            fact_count,
            rule_count,
            episode_count,
        })
    }

    /// Admit lines in order until the budget would be exceeded. Lines
    /// arrive highest-score-first, so anything dropped scores below
    /// everything retained. The header is only charged when at least one
    /// line fits.
    fn admit_section(
        &self,
        text: &mut String,
        used: &mut usize,
        budget: usize,
        header: &str,
        lines: &[String],
    ) -> usize {
        let mut admitted = 0;
        for line in lines {
            let mut cost = self.tokenizer.count(line);
            if admitted == 0 {
                cost += self.tokenizer.count(header) + self.tokenizer.count("\n");
            }
            if *used + cost > budget {
                break;
            }
            if admitted == 0 {
                text.push_str(header);
                text.push('\n');
            }
            text.push_str(line);
            *used += cost;
            admitted += 1;
        }
        admitted
    }
}

fn render_fact(result: &ScoredItem) -> String {
    format!(
        "- {} (confidence {:.2})\n",
        result.item.content().trim(),
        result.confidence
    )
}

fn render_rule(result: &ScoredItem) -> String {
    let maturity = match &result.item {
        crate::retrieval::MemoryItem::Rule(rule) => rule.maturity.as_str(),
        _ => "",
    };
    format!("- [{}] {}\n", maturity, result.item.content().trim())
}
