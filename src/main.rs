use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use novel2comic::core::config::{Config, DEFAULT_CONFIG_PATH};
use novel2comic::core::io::{NativeStorage, Storage};
use novel2comic::core::state::{GateEdits, PanelId, Phase, PipelineStage, RunState, RunStatus};
use novel2comic::core::store::RunStore;
use novel2comic::services::ingest::read_input;
use novel2comic::services::interactive;
use novel2comic::services::review::Review;
use novel2comic::services::stage::create_stages;
use novel2comic::services::workflow::WorkflowManager;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "novel2comic", version, about = "Turn prose into a consistently drawn comic")]
struct Cli {
    /// Path to the YAML config.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum PhaseArg {
    /// Script, design and direct, then stop at the approval gate.
    Plan,
    /// Pass the gate (if approved) and draw the panels.
    Draw,
    /// Plan, ask for approval, then draw.
    All,
}

#[derive(Subcommand)]
enum Command {
    /// Register a text file as a run.
    Ingest { input: PathBuf },
    /// Run or resume a pipeline.
    Run {
        run_id: Option<String>,
        /// Ingest this file first and run the result.
        #[arg(short, long, conflicts_with = "run_id")]
        input: Option<PathBuf>,
        #[arg(short, long, value_enum, default_value = "all")]
        phase: PhaseArg,
    },
    /// Show where a run stands.
    Status { run_id: String },
    /// List stored runs.
    List,
    /// Approve the plan gate, optionally with a YAML file of edits.
    Approve {
        run_id: String,
        #[arg(long)]
        edits: Option<PathBuf>,
        #[arg(long)]
        approver: Option<String>,
        /// Version the decision was made against. Defaults to the stored one.
        #[arg(long)]
        expected_version: Option<u64>,
    },
    /// Stop a run at its next step.
    Pause { run_id: String },
    /// Redraw panels of a complete run.
    Regenerate {
        run_id: String,
        panel_id: Option<PanelId>,
        #[arg(long, conflicts_with_all = ["panel_id", "stale"])]
        failed: bool,
        #[arg(long, conflicts_with = "panel_id")]
        stale: bool,
    },
    /// Delete a run.
    Discard {
        run_id: String,
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match Config::load_from(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure '{}' exists with valid LLM settings.", cli.config.display());
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let store = Arc::new(RunStore::new(config.runs_folder())?);
    let review = Review::new(store.clone());

    match cli.command {
        Command::Status { run_id } => {
            interactive::print_summary(&review.state(&run_id).await?);
        }
        Command::List => {
            let ids = store.list().await?;
            if ids.is_empty() {
                println!("No runs in {}", store.root().display());
            }
            for id in ids {
                let state = store.load(&id).await?;
                println!(
                    "{}  {:<18} {:<17} v{}  {}",
                    id, state.stage_cursor, state.status, state.version, state.script.title
                );
            }
        }
        Command::Approve {
            run_id,
            edits,
            approver,
            expected_version,
        } => {
            let edits = edits.map(|path| load_edits(&path)).transpose()?;
            let expected = match expected_version {
                Some(v) => v,
                None => review.state(&run_id).await?.version,
            };
            let approver = approver.unwrap_or_else(default_approver);
            let state = review.approve(&run_id, expected, edits, &approver).await?;
            interactive::print_summary(&state);
        }
        Command::Pause { run_id } => {
            let current = review.state(&run_id).await?;
            let state = review.pause(&run_id, current.version).await?;
            interactive::print_summary(&state);
        }
        Command::Discard { run_id, yes } => {
            let current = review.state(&run_id).await?;
            if !yes && !inquire::Confirm::new(&format!("Discard run {}?", run_id))
                .with_default(false)
                .prompt()?
            {
                return Ok(());
            }
            review.discard(&run_id, current.version).await?;
            let panels = std::path::Path::new(&config.output_folder).join(&run_id);
            NativeStorage::new()
                .delete(&panels.to_string_lossy())
                .await
                .with_context(|| format!("Failed to remove {}", panels.display()))?;
            println!("Discarded {}", run_id);
        }
        Command::Ingest { input } => {
            let manager = build_manager(&mut config, &cli.config, store)?;
            let state = manager.ingest(&read_input(&input)?).await?;
            interactive::print_summary(&state);
        }
        Command::Run { run_id, input, phase } => {
            let manager = build_manager(&mut config, &cli.config, store.clone())?;
            let run_id = match (run_id, input) {
                (Some(id), _) => id,
                (None, Some(path)) => manager.ingest(&read_input(&path)?).await?.run_id,
                (None, None) => {
                    let ids = store.list().await?;
                    if ids.is_empty() {
                        bail!("No runs yet. Pass --input to start one.");
                    }
                    interactive::select_run(ids)?
                }
            };
            let state = drive(&manager, &review, &run_id, phase, config.unattended).await?;
            interactive::print_summary(&state);
        }
        Command::Regenerate {
            run_id,
            panel_id,
            failed,
            stale,
        } => {
            let manager = build_manager(&mut config, &cli.config, store)?;
            let state = match (panel_id, failed, stale) {
                (Some(id), _, _) => manager.regenerate_panel(&run_id, id).await?,
                (None, true, _) => manager.retry_failed_panels(&run_id).await?,
                (None, _, true) => manager.refresh_stale_panels(&run_id).await?,
                _ => bail!("Pass a panel id, --failed or --stale"),
            };
            interactive::print_summary(&state);
        }
    }

    Ok(())
}

fn build_manager(config: &mut Config, path: &std::path::Path, store: Arc<RunStore>) -> Result<WorkflowManager> {
    interactive::run_setup(config, path)?;
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let stages = create_stages(config, storage)?;
    Ok(WorkflowManager::new(config.clone(), stages, store))
}

async fn drive(
    manager: &WorkflowManager,
    review: &Review,
    run_id: &str,
    phase: PhaseArg,
    unattended: bool,
) -> Result<RunState> {
    match phase {
        PhaseArg::Plan => Ok(manager.run(run_id, Phase::Plan).await?),
        PhaseArg::Draw => Ok(manager.run(run_id, Phase::Draw).await?),
        PhaseArg::All => {
            let planned = manager.run(run_id, Phase::Plan).await?;
            if planned.stage_cursor > PipelineStage::AwaitingApproval && !planned.status.is_terminal() {
                return Ok(manager.run(run_id, Phase::Draw).await?);
            }
            if planned.status != RunStatus::AwaitingApproval || unattended {
                if planned.status.is_terminal() || planned.status == RunStatus::Paused {
                    return Ok(planned);
                }
                return Ok(manager.run(run_id, Phase::Draw).await?);
            }
            if !interactive::confirm_approval(&planned)? {
                info!("Plan left unapproved; run `approve {}` when ready", run_id);
                return Ok(planned);
            }
            review
                .approve(run_id, planned.version, None, &default_approver())
                .await?;
            Ok(manager.run(run_id, Phase::Draw).await?)
        }
    }
}

fn load_edits(path: &std::path::Path) -> Result<GateEdits> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml_ng::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn default_approver() -> String {
    std::env::var("USER").unwrap_or_else(|_| "operator".to_string())
}
