use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use strata::memory::types::{EntityKind, EntityRef, Permanence};
use strata::retrieval::MemoryItem;
use strata::service::{EpisodeInput, FactInput, RuleInput};
use strata::{CallerIdentity, MemoryService};
use uuid::Uuid;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct MemoryCommand {
    #[clap(subcommand)]
    pub command: MemorySubcommand,
}

#[derive(Subcommand)]
pub enum MemorySubcommand {
    #[clap(about = "Record a raw observation as a pending episode")]
    Remember(RememberArgs),

    #[clap(about = "Store a fact (supersedes a matching active fact)")]
    Fact(FactArgs),

    #[clap(about = "Store a new candidate rule")]
    Rule(RuleArgs),

    #[clap(about = "Show one memory item")]
    Show(ShowArgs),

    #[clap(about = "Reset the decay clock on a fact or rule")]
    Confirm(ShowArgs),

    #[clap(about = "Soft-delete a memory item")]
    Forget(ShowArgs),

    #[clap(about = "Report that applying a rule helped")]
    Helpful(FeedbackArgs),

    #[clap(about = "Report that applying a rule caused harm")]
    Harmful(FeedbackArgs),

    #[clap(about = "Show the audit trail for a memory item")]
    Events(ShowArgs),
}

#[derive(Parser)]
pub struct RememberArgs {
    #[clap(help = "Observation text")]
    pub content: String,

    #[clap(long, default_value = "cli", help = "Owning subsystem or session source")]
    pub source: String,

    #[clap(long, help = "Session identifier")]
    pub session: Option<String>,

    #[clap(long, help = "Importance 0-10")]
    pub importance: Option<f64>,
}

#[derive(Parser)]
pub struct FactArgs {
    #[clap(help = "Subject of the statement, e.g. 'user'")]
    pub subject: String,

    #[clap(help = "Predicate of the statement, e.g. 'favorite_editor'")]
    pub predicate: String,

    #[clap(help = "Full statement content")]
    pub content: String,

    #[clap(long, help = "Importance 0-10")]
    pub importance: Option<f64>,

    #[clap(
        long,
        help = "Permanence (permanent, stable, standard, volatile, ephemeral)"
    )]
    pub permanence: Option<String>,

    #[clap(long, help = "Visibility scope (defaults to global)")]
    pub scope: Option<String>,
}

#[derive(Parser)]
pub struct RuleArgs {
    #[clap(help = "Guidance content")]
    pub content: String,

    #[clap(long, help = "Visibility scope (defaults to global)")]
    pub scope: Option<String>,
}

#[derive(Parser)]
pub struct ShowArgs {
    #[clap(help = "Memory type (episode, fact, rule)")]
    pub r#type: String,

    #[clap(help = "Item id (UUID format)")]
    pub id: String,
}

#[derive(Parser)]
pub struct FeedbackArgs {
    #[clap(help = "Rule id (UUID format)")]
    pub id: String,

    #[clap(long, help = "Why the rule helped or hurt")]
    pub reason: Option<String>,
}

impl ShowArgs {
    fn entity(&self) -> CliResult<EntityRef> {
        let kind = EntityKind::parse(&self.r#type)?;
        let id = Uuid::parse_str(&self.id)?;
        Ok(EntityRef { kind, id })
    }
}

impl MemoryCommand {
    pub fn execute(
        &self,
        service: &MemoryService,
        caller: &CallerIdentity,
        format: OutputFormat,
    ) -> CliResult<()> {
        match &self.command {
            MemorySubcommand::Remember(args) => {
                let id = service.store_episode(
                    caller,
                    EpisodeInput {
                        content: args.content.clone(),
                        source: args.source.clone(),
                        session: args.session.clone(),
                        importance: args.importance,
                        tags: Vec::new(),
                    },
                )?;
                print_id(format, "episode", id)
            }
            MemorySubcommand::Fact(args) => {
                let permanence = args
                    .permanence
                    .as_deref()
                    .map(Permanence::parse)
                    .transpose()?;
                let stored = service.store_fact(
                    caller,
                    FactInput {
                        subject: args.subject.clone(),
                        predicate: args.predicate.clone(),
                        content: args.content.clone(),
                        importance: args.importance,
                        permanence,
                        scope: args.scope.clone(),
                        tags: Vec::new(),
                    },
                )?;
                if let Some(old) = stored.superseded {
                    eprintln!("superseded fact {old}");
                }
                print_id(format, "fact", stored.fact.id)
            }
            MemorySubcommand::Rule(args) => {
                let id = service.store_rule(
                    caller,
                    RuleInput {
                        content: args.content.clone(),
                        scope: args.scope.clone(),
                        tags: Vec::new(),
                    },
                )?;
                print_id(format, "rule", id)
            }
            MemorySubcommand::Show(args) => {
                let item = service.get(caller, args.entity()?)?;
                show_item(&item, format)
            }
            MemorySubcommand::Confirm(args) => {
                service.confirm(caller, args.entity()?)?;
                println!("confirmed");
                Ok(())
            }
            MemorySubcommand::Forget(args) => {
                service.forget(caller, args.entity()?)?;
                println!("forgotten");
                Ok(())
            }
            MemorySubcommand::Helpful(args) => {
                let change = service.mark_helpful(caller, Uuid::parse_str(&args.id)?)?;
                println!("{change:?}");
                Ok(())
            }
            MemorySubcommand::Harmful(args) => {
                let change = service.mark_harmful(
                    caller,
                    Uuid::parse_str(&args.id)?,
                    args.reason.clone(),
                )?;
                println!("{change:?}");
                Ok(())
            }
            MemorySubcommand::Events(args) => {
                let events = service.events(caller, args.entity()?)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&events)?);
                    }
                    OutputFormat::Table => {
                        let mut table = Table::new();
                        table
                            .load_preset(UTF8_FULL_CONDENSED)
                            .set_content_arrangement(ContentArrangement::Dynamic)
                            .set_header(vec!["Time", "Event", "Actor"]);
                        for event in &events {
                            table.add_row(vec![
                                format_timestamp(&event.created_at),
                                event.event.clone(),
                                event.actor.clone(),
                            ]);
                        }
                        println!("{table}");
                    }
                }
                Ok(())
            }
        }
    }
}

fn print_id(format: OutputFormat, kind: &str, id: Uuid) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "type": kind, "id": id }));
        }
        OutputFormat::Table => println!("{id}"),
    }
    Ok(())
}

fn show_item(item: &MemoryItem, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            let json = match item {
                MemoryItem::Episode(e) => serde_json::to_string_pretty(e)?,
                MemoryItem::Fact(f) => serde_json::to_string_pretty(f)?,
                MemoryItem::Rule(r) => serde_json::to_string_pretty(r)?,
            };
            println!("{json}");
        }
        OutputFormat::Table => {
            println!("Type:    {}", item.kind().as_str());
            println!("Id:      {}", item.id());
            println!("Created: {}", format_timestamp(&item.created_at()));
            match item {
                MemoryItem::Episode(e) => {
                    println!("Source:  {}", e.source);
                    println!("Status:  {}", e.status.as_str());
                }
                MemoryItem::Fact(f) => {
                    println!("Key:     {}/{}", f.subject, f.predicate);
                    println!("Scope:   {}", f.scope);
                    println!("State:   {}", f.validity.as_str());
                }
                MemoryItem::Rule(r) => {
                    println!("Maturity: {}", r.maturity.as_str());
                    println!(
                        "Feedback: {} applied, {} helpful, {} harmful",
                        r.applied_count, r.success_count, r.harmful_count
                    );
                }
            }
            println!("Content: {}", truncate_string(item.content(), 200));
        }
    }
    Ok(())
}
