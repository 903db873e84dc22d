//! The `rye` multitool: `exec`, `search`, `load`, `sign`.
//!
//! Structured JSON goes to stdout; human-readable progress goes to stderr
//! so output stays machine-parseable. Exit code 0 on success, non-zero on
//! any failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use serde_json::Value;
use serde_json::json;

use rye_common::elapsed::format_duration;
use rye_core::Config;
use rye_core::dispatch::DispatchRequest;
use rye_core::dispatch::RyeDispatcher;
use rye_core::dispatch::ToolDispatcher;
use rye_core::executor::PrimitiveExecutor;
use rye_core::items;
use rye_core::signing::Keypair;
use rye_core::spaces::ItemType;

#[derive(Parser)]
#[command(name = "rye", version, about = "Execute, search, load, and sign rye items")]
pub struct Cli {
    /// Project root containing `.ai/`. Defaults to the current directory.
    #[arg(long, global = true)]
    pub project_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a tool or directive.
    Exec {
        /// Item id, e.g. `rye/file-system/fs_write`.
        item_id: String,
        /// Item type: tool, directive, or knowledge.
        #[arg(long, default_value = "tool")]
        item_type: String,
        /// JSON object of parameters.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Validate the chain without executing.
        #[arg(long)]
        dry_run: bool,
    },
    /// Search items by id substring or glob.
    Search {
        /// Scope: tool, directive, or knowledge.
        scope: String,
        query: String,
    },
    /// Load an item, verifying its signature first.
    Load {
        item_type: String,
        item_id: String,
    },
    /// Validate and sign an item in place.
    Sign {
        item_type: String,
        item_id: String,
    },
}

fn parse_item_type(raw: &str) -> Result<ItemType> {
    ItemType::parse(raw)
        .with_context(|| format!("unknown item type '{raw}' (expected tool, directive, or knowledge)"))
}

/// Load the signing identity, importing `RYE_SIGNING_KEY` on hosts without
/// a keypair on disk (CI, serverless).
fn load_identity(config: &Config) -> Result<Keypair> {
    let keys_dir = config.keys_dir();
    if let Some(pem) = *rye_core::flags::RYE_SIGNING_KEY {
        if !keys_dir.join(rye_core::signing::PRIVATE_KEY_FILE).exists() {
            eprintln!("importing signing key from RYE_SIGNING_KEY");
            return Ok(Keypair::import_pem(&keys_dir, pem)?);
        }
    }
    Ok(Keypair::ensure(&keys_dir)?)
}

pub async fn run(cli: Cli) -> Result<Value> {
    let project_path = cli
        .project_path
        .or_else(|| std::env::current_dir().ok())
        .map(|p| p.canonicalize().unwrap_or(p));
    let config = Config::load(project_path)?;
    let keypair = load_identity(&config)?;
    let started = Instant::now();

    let result = match cli.command {
        Command::Exec {
            item_id,
            item_type,
            params,
            dry_run,
        } => {
            let item_type_parsed = parse_item_type(&item_type)?;
            let params: Value = serde_json::from_str(&params)
                .with_context(|| "params must be a JSON object".to_string())?;
            eprintln!("exec {item_type} {item_id}");

            if dry_run && item_type_parsed == ItemType::Tool {
                let executor = PrimitiveExecutor::new(config, keypair);
                let (chain, validated_pairs) = executor.dry_run(&item_id)?;
                json!({
                    "status": "validation_passed",
                    "message": "Tool chain validation passed (dry run)",
                    "item_id": item_id,
                    "chain": chain,
                    "validated_pairs": validated_pairs,
                })
            } else if item_type_parsed == ItemType::Directive {
                let params: HashMap<String, Value> = params
                    .as_object()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                items::execute_directive_inline(&config, &item_id, &params)?
            } else {
                let executor = PrimitiveExecutor::new(config, keypair);
                let dispatcher = RyeDispatcher::new(executor);
                dispatcher
                    .dispatch(DispatchRequest {
                        primary: "execute".to_string(),
                        item_type,
                        item_id,
                        params,
                    })
                    .await?
            }
        }
        Command::Search { scope, query } => {
            let item_type = parse_item_type(&scope)?;
            eprintln!("search {scope} '{query}'");
            let hits = items::search(&config, item_type, &query);
            json!({
                "status": "success",
                "count": hits.len(),
                "results": hits,
            })
        }
        Command::Load { item_type, item_id } => {
            let item_type = parse_item_type(&item_type)?;
            eprintln!("load {item_type} {item_id}");
            items::load_item(&config, item_type, &item_id)?
        }
        Command::Sign { item_type, item_id } => {
            let item_type = parse_item_type(&item_type)?;
            eprintln!("sign {item_type} {item_id}");
            items::sign_item(&config, &keypair, item_type, &item_id)?
        }
    };

    eprintln!("done in {}", format_duration(started.elapsed()));
    Ok(result)
}
