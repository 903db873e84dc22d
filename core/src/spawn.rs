//! Thread bring-up: registry row, budget reservation, capability token,
//! harness construction, and the first run of the loop.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::budget::BudgetLedger;
use crate::classifier::ErrorClassifier;
use crate::client::ProviderAdapter;
use crate::config::Config;
use crate::dispatch::ToolDispatcher;
use crate::error::Result;
use crate::harness::SafetyHarness;
use crate::interpolate::resolve_input_refs;
use crate::items::load_directive;
use crate::registry::ThreadRegistry;
use crate::runner::RunOutcome;
use crate::runner::ThreadRunner;
use crate::runner::ToolDef;
use crate::signing::Keypair;
use crate::state::save_metadata;
use crate::token::mint_token;
use crate::transcript::TranscriptWriter;
use rye_protocol::Awaiting;
use rye_protocol::EventType;
use rye_protocol::Limits;
use rye_protocol::ThreadMetadata;
use rye_protocol::ThreadMode;
use rye_protocol::ThreadStatus;

/// Default reservation for a child thread whose directive declares no
/// spend limit.
pub const DEFAULT_CHILD_RESERVATION: f64 = 1.0;

/// Parent context injected into child spawns.
#[derive(Debug, Clone)]
pub struct ParentContext {
    pub thread_id: String,
    pub depth: u64,
    pub limits: Limits,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub mode: ThreadMode,
    pub limit_overrides: Limits,
    pub max_spend: Option<f64>,
    pub parent: Option<ParentContext>,
}

fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Execute a directive as a supervised thread.
#[expect(clippy::too_many_arguments)]
pub async fn spawn_thread<P: ProviderAdapter>(
    config: &Config,
    keypair: &Keypair,
    directive_id: &str,
    inputs: &HashMap<String, Value>,
    provider: &P,
    dispatcher: &dyn ToolDispatcher,
    tool_defs: &[ToolDef],
    options: SpawnOptions,
) -> Result<RunOutcome> {
    let directive = load_directive(config, directive_id)?;
    let resolved_inputs = directive
        .resolve_inputs(inputs)
        .map_err(|issues| crate::error::RyeErr::Validation { issues })?;

    let thread_id = format!("{}-{}", directive.name, unix_now());
    let thread_dir = config.thread_dir(&thread_id);
    let threads_dir = config.threads_dir();
    let limits = directive.limits.with_overrides(&options.limit_overrides);

    // Depth limit is enforced before anything is registered.
    let depth = options.parent.as_ref().map(|p| p.depth + 1).unwrap_or(0);
    if let Some(max_depth) = limits.depth {
        if depth > max_depth {
            return Err(crate::error::RyeErr::LimitExceeded {
                limit_code: "depth_exceeded".to_string(),
                current_value: depth as f64,
                current_max: max_depth as f64,
            });
        }
    }

    // Checkpoints sign with the local key; make sure it is trusted before
    // the first signature lands.
    crate::trust::TrustStore::new(config).ensure_self_trusted(keypair)?;

    let registry = ThreadRegistry::new(&threads_dir)?;
    let ledger = BudgetLedger::new(&threads_dir)?;

    // Child processes inherit their parent linkage through the environment
    // even when no in-process parent context was supplied.
    let registry_parent: Option<String> = options
        .parent
        .as_ref()
        .map(|p| p.thread_id.clone())
        .or_else(|| {
            crate::flags::RYE_PARENT_THREAD_ID
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        });
    registry.register(
        &thread_id,
        &directive.name,
        registry_parent.as_deref(),
        directive.model.id.as_deref(),
    )?;

    // Budget: roots register their own pool; children reserve from the
    // parent atomically. A failed reservation surfaces to the caller
    // before the thread ever runs.
    let reservation = options
        .max_spend
        .or(limits.spend)
        .unwrap_or(DEFAULT_CHILD_RESERVATION);
    match &options.parent {
        Some(parent) => {
            ledger.reserve(&thread_id, reservation, &parent.thread_id, limits.spend)?;
            registry.increment_spawn_count(&parent.thread_id)?;
        }
        None => ledger.register(&thread_id, Some(reservation), None)?,
    }

    let mut hooks = directive.hooks.clone();
    hooks.extend(context_hooks(&directive));
    let harness = SafetyHarness::new(
        thread_id.clone(),
        directive.name.clone(),
        limits.clone(),
        hooks,
        &directive.permissions,
        options.parent.as_ref().map(|p| p.capabilities.as_slice()),
    );

    let token = mint_token(
        keypair,
        harness.capabilities().to_vec(),
        directive_id,
        &thread_id,
        options.parent.as_ref().map(|p| p.thread_id.clone()),
    );
    persist_token(&thread_dir, &token.to_jwt())?;

    let now = now_iso();
    let mut meta = ThreadMetadata {
        thread_id: thread_id.clone(),
        directive: directive.name.clone(),
        parent_thread_id: options.parent.as_ref().map(|p| p.thread_id.clone()),
        status: ThreadStatus::Running,
        thread_mode: options.mode,
        model: directive.model.clone(),
        tool_defs: tool_defs
            .iter()
            .map(|t| (t.name.clone(), t.schema.clone()))
            .collect(),
        limits: limits.clone(),
        turn_count: 0,
        cost: Default::default(),
        pid: Some(std::process::id()),
        continuation_of: None,
        continuation_thread_id: None,
        chain_root_id: None,
        awaiting: None,
        created_at: now.clone(),
        updated_at: now,
        signature: None,
    };
    save_metadata(&thread_dir, &meta, keypair)?;
    registry.update_status(&thread_id, ThreadStatus::Running)?;

    let transcript = TranscriptWriter::new(thread_id.clone(), &thread_dir);
    transcript.write_event(
        EventType::ThreadStart,
        json!({
            "directive": directive.name,
            "mode": options.mode.to_string(),
            "limits": limits,
            "token_id": token.token_id,
        }),
    )?;

    let classifier = ErrorClassifier::load(config);
    let runner = ThreadRunner {
        harness: &harness,
        provider,
        dispatcher,
        transcript: &transcript,
        registry: &registry,
        ledger: &ledger,
        keypair,
        classifier: &classifier,
        tool_defs,
        thread_dir: thread_dir.clone(),
        depth,
        pause_on_complete: options.mode == ThreadMode::Conversation,
    };

    // The directive body, with input refs resolved, is the initial prompt.
    let prompt_context = json!({ "inputs": resolved_inputs });
    let prompt = resolve_input_refs(&directive.body, &prompt_context);
    let first = runner.build_first_message(&prompt).await?;
    transcript.write_event(
        EventType::UserMessage,
        json!({"text": first.content, "role": "user", "directive": directive.name}),
    )?;

    info!(%thread_id, directive = %directive.name, "thread starting");
    let outcome = runner.run_loop(vec![first], Default::default()).await?;

    meta.status = outcome.status;
    meta.turn_count = outcome.cost.turns;
    meta.cost = outcome.cost.clone();
    meta.awaiting = (outcome.status == ThreadStatus::Paused).then_some(Awaiting::User);
    meta.updated_at = now_iso();
    save_metadata(&thread_dir, &meta, keypair)?;

    // A terminal child's spend rolls up into its parent's accumulator; the
    // released remainder is already back in the parent's pool.
    if outcome.status.is_terminal() {
        if let Some(parent) = &options.parent {
            ledger.cascade_spend(&parent.thread_id, outcome.cost.spend)?;
        }
    }

    Ok(outcome)
}

fn persist_token(thread_dir: &Path, jwt: &str) -> Result<()> {
    std::fs::create_dir_all(thread_dir)?;
    std::fs::write(thread_dir.join("token.jwt"), jwt)?;
    Ok(())
}

/// Derive `thread_started` context-injection hooks from the directive's
/// context block. `system` and `before` items land before the prompt,
/// `after` items behind it; suppressed ids are dropped.
fn context_hooks(directive: &rye_protocol::Directive) -> Vec<rye_protocol::Hook> {
    let suppressed: std::collections::HashSet<&String> =
        directive.context.suppress.iter().collect();
    let load_hook = |item_id: &String, position: rye_protocol::HookPosition| rye_protocol::Hook {
        event: "thread_started".to_string(),
        condition: None,
        action: Some(rye_protocol::HookAction {
            primary: "load".to_string(),
            item_type: "knowledge".to_string(),
            item_id: item_id.clone(),
            params: serde_json::Value::Null,
        }),
        actions: Vec::new(),
        directive: None,
        layer: rye_protocol::HookLayer::Builtin,
        position,
    };

    directive
        .context
        .system
        .iter()
        .chain(&directive.context.before)
        .filter(|id| !suppressed.contains(*id))
        .map(|id| load_hook(id, rye_protocol::HookPosition::Before))
        .chain(
            directive
                .context
                .after
                .iter()
                .filter(|id| !suppressed.contains(*id))
                .map(|id| load_hook(id, rye_protocol::HookPosition::After)),
        )
        .collect()
}
