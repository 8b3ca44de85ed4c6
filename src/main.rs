use anyhow::Result;
use clap::{Parser, Subcommand};
use fathom::admin;
use fathom::config::{self, Config};
use fathom::flow::{self, FlowMode, FlowRequest, FlowResult, FlowStatus};
use fathom::gateway::OpenAiGateway;
use fathom::query::sanitize_query;
use fathom::rate_limit::{ExplainTier, RateLimiter};
use fathom::schema::{Block, ExplanationContent, Level};
use fathom::store::JsonStore;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "fathom",
    about = "Turn a curious question into a structured explanation",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Explain a topic at a given depth
    Explain {
        /// The question or topic to explain
        query: String,

        /// Explanation depth: eli5, eli10, or expert
        #[arg(short, long, default_value = "eli5")]
        level: Level,

        /// Ask for a fresh variant instead of the cached explanation
        #[arg(long)]
        variant: bool,

        /// Regenerate even when a cached explanation exists
        #[arg(long)]
        force: bool,
    },

    /// Check whether an explanation is already cached
    Check {
        query: String,

        #[arg(short, long, default_value = "eli5")]
        level: Level,
    },

    /// Make the explanation from a flow run publicly visible
    Promote { run_id: Uuid },

    /// Regenerate a past flow run, replacing its cached content
    Rerun { run_id: Uuid },

    /// Generate an additional variant for a past flow run
    NewVariant { run_id: Uuid },

    /// Block an explanation pending review
    Block {
        explanation_id: Uuid,

        /// Why the content is being pulled
        #[arg(short, long)]
        reason: String,
    },

    /// Restore a blocked explanation to public
    Restore { explanation_id: Uuid },

    /// Credit a variant as helpful
    Helpful { variant_id: Uuid },

    /// Configure the OpenAI API key
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fathom=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load();
    let store = JsonStore::new(config.store_dir());
    let limiter = RateLimiter::new();

    match args.command {
        Commands::Explain {
            query,
            level,
            variant,
            force,
        } => {
            let sanitized = sanitize_query(&query);
            if sanitized.chars().count() < 2 {
                anyhow::bail!("Please provide a topic and level.");
            }

            let mode = if variant {
                FlowMode::NewVariant
            } else {
                FlowMode::Default
            };

            // Cheap probe first so cached reads draw on the larger budget.
            let cache_hit = mode == FlowMode::Default
                && !force
                && flow::check_explain_cache(&store, &sanitized, level)?;
            let tier = if cache_hit {
                ExplainTier::Cached
            } else {
                ExplainTier::Generate
            };

            let caller = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
            let decision = limiter.check_explain(&caller, tier);
            if !decision.allowed {
                anyhow::bail!("Too many requests. Please try again shortly.");
            }

            let gateway = OpenAiGateway::from_config(&config)?;
            let result = flow::run_flow(
                &store,
                &gateway,
                FlowRequest {
                    raw_query: sanitized,
                    level,
                    mode,
                    force_generate: force,
                },
            )
            .await?;

            print_result(&result);
            if result.status == FlowStatus::Failed {
                std::process::exit(1);
            }
        }

        Commands::Check { query, level } => {
            let cached = flow::check_explain_cache(&store, &query, level)?;
            println!("{}", if cached { "cached" } else { "not cached" });
        }

        Commands::Promote { run_id } => {
            let explanation_id = admin::promote_flow_run(&store, run_id)?;
            println!("Promoted explanation {}", explanation_id);
        }

        Commands::Rerun { run_id } => {
            let gateway = OpenAiGateway::from_config(&config)?;
            let result = admin::rerun_flow(&store, &gateway, run_id).await?;
            print_result(&result);
        }

        Commands::NewVariant { run_id } => {
            let gateway = OpenAiGateway::from_config(&config)?;
            let result = admin::new_variant_from_run(&store, &gateway, run_id).await?;
            print_result(&result);
        }

        Commands::Block {
            explanation_id,
            reason,
        } => {
            admin::block_explanation(&store, explanation_id, &reason)?;
            println!("Blocked explanation {}", explanation_id);
        }

        Commands::Restore { explanation_id } => {
            admin::restore_explanation(&store, explanation_id)?;
            println!("Restored explanation {}", explanation_id);
        }

        Commands::Helpful { variant_id } => {
            admin::record_helpful_signal(&store, variant_id)?;
            println!("Recorded helpful signal for variant {}", variant_id);
        }

        Commands::Setup => {
            config::setup_api_key_interactive()?;
        }
    }

    Ok(())
}

fn print_result(result: &FlowResult) {
    match result.status {
        FlowStatus::Failed => {
            let message = result
                .message
                .as_deref()
                .unwrap_or("Something went wrong.");
            eprintln!("{}", message);
            eprintln!("(flow run {})", result.flow_run_id);
        }
        _ => {
            if let Some(content) = &result.explanation {
                render_explanation(content, result.cache_hit);
            }
            println!();
            println!("  flow run: {}", result.flow_run_id);
            if let Some(id) = result.explanation_id {
                println!("  explanation: {}", id);
            }
            if let Some(id) = result.variant_id {
                println!("  variant: {}", id);
            }
        }
    }
}

fn render_explanation(content: &ExplanationContent, cache_hit: bool) {
    let source = if cache_hit { "cached" } else { "generated" };
    println!();
    println!("  {} ({}, {})", content.title, content.level, source);
    println!();
    println!("  {}", content.summary);

    for block in &content.blocks {
        println!();
        match block {
            Block::Heading { text } => println!("  ## {}", text),
            Block::Paragraph { text } => println!("  {}", text),
            Block::Analogy { title, text } => {
                println!("  [analogy] {}", title.as_deref().unwrap_or("Analogy"));
                println!("  {}", text);
            }
            Block::Steps { title, items } => {
                println!("  [steps] {}", title.as_deref().unwrap_or("Steps"));
                for (i, item) in items.iter().enumerate() {
                    println!("  {}. {}", i + 1, item);
                }
            }
            Block::Intuition { title, text } => {
                println!("  [intuition] {}", title.as_deref().unwrap_or("Intuition"));
                println!("  {}", text);
            }
            Block::Technical { title, text } => {
                println!("  [technical] {}", title.as_deref().unwrap_or("Technical"));
                println!("  {}", text);
            }
            Block::Equation { latex, explanation } => {
                println!("  [equation] {}", latex);
                if let Some(explanation) = explanation {
                    println!("  {}", explanation);
                }
            }
            Block::Callout { tone, text } => {
                println!("  [{:?}] {}", tone, text);
            }
            Block::Check { questions } => {
                println!("  Check yourself:");
                for question in questions {
                    println!("  - {}", question);
                }
            }
        }
    }

    if !content.related_topics.is_empty() {
        println!();
        println!("  Related: {}", content.related_topics.join(", "));
    }
}
