use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use specrun_artifact::{ArtifactStore, LockMode, PipelineInput, RunId};
use specrun_audit::TraceabilityMatrix;
use specrun_core::{
    Amendment, CollaborationLog, ConfigError, DerivedRunError, ExecutorRegistry, Orchestrator,
    OrchestratorError, PipelineConfig, RunOutcome,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_ERROR: u8 = 1;

fn cli() -> Command {
    Command::new("specrun")
        .version(specrun_core::VERSION)
        .about("Gated, auditable specification runs")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Pipeline configuration (YAML)"),
        )
        .arg(
            Arg::new("runs-dir")
                .long("runs-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding run folders; overrides the configuration"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Use the built-in deterministic executor"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("run")
                .about("Start a new run from a feature description")
                .arg(
                    Arg::new("input")
                        .long("input")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("File holding the feature description"),
                ),
        )
        .subcommand(
            Command::new("resume")
                .about("Continue an interrupted run")
                .arg(Arg::new("run_id").required(true).help("Run to resume"))
                .arg(
                    Arg::new("break-lock")
                        .long("break-lock")
                        .action(ArgAction::SetTrue)
                        .help("Remove a lock left by a killed process"),
                ),
        )
        .subcommand(
            Command::new("derive")
                .about("Start a derived run from an amendment to a finished run")
                .arg(Arg::new("base-run").long("base-run").required(true).help("Finished base run"))
                .arg(
                    Arg::new("amendment")
                        .long("amendment")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Amendment JSON file"),
                ),
        )
        .subcommand(
            Command::new("verify")
                .about("Re-hash every artifact and check the collaboration log chain")
                .arg(Arg::new("run_id").required(true)),
        )
        .subcommand(
            Command::new("trace")
                .about("Print the traceability matrix of a run")
                .arg(Arg::new("run_id").required(true))
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("validate-config")
                .about("Parse and validate a pipeline configuration")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("SPECRUN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("specrun=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match dispatch(&matches).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!(kind = error_kind(&err), "{err:#}");
            eprintln!("error[{}]: {err:#}", error_kind(&err));
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn dispatch(matches: &ArgMatches) -> Result<u8> {
    match matches.subcommand() {
        Some(("run", args)) => {
            let path = args
                .get_one::<PathBuf>("input")
                .context("--input is required")?;
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading input {}", path.display()))?;
            let input = PipelineInput::new(content).with_source(path.display().to_string());
            let orchestrator = orchestrator(args)?;
            let outcome = with_ctrl_c(&orchestrator, orchestrator.start(input)).await?;
            Ok(report(&outcome))
        }
        Some(("resume", args)) => {
            let run_id = parse_run_id(args, "run_id")?;
            let mode = if args.get_flag("break-lock") {
                LockMode::BreakStale
            } else {
                LockMode::Exclusive
            };
            let orchestrator = orchestrator(args)?;
            let outcome = with_ctrl_c(&orchestrator, orchestrator.resume(&run_id, mode)).await?;
            Ok(report(&outcome))
        }
        Some(("derive", args)) => {
            let base = parse_run_id(args, "base-run")?;
            let path = args
                .get_one::<PathBuf>("amendment")
                .context("--amendment is required")?;
            let amendment = Amendment::from_json_file(path)?;
            let orchestrator = orchestrator(args)?;
            let outcome =
                with_ctrl_c(&orchestrator, orchestrator.start_derived_run(&base, &amendment)).await?;
            Ok(report(&outcome))
        }
        Some(("verify", args)) => {
            let run_id = parse_run_id(args, "run_id")?;
            let store = store(args)?;
            let verified = store.verify_run(&run_id)?;
            for failure in &verified.failures {
                eprintln!("corrupt: {} ({})", failure.file_ref, failure.reason);
            }
            let events = CollaborationLog::verify_integrity(&store.run_dir(&run_id))?;
            println!("{} artifact(s) checked, {} log event(s) chained", verified.checked, events);
            Ok(if verified.is_ok() { 0 } else { EXIT_ERROR })
        }
        Some(("trace", args)) => {
            let run_id = parse_run_id(args, "run_id")?;
            let artifacts = store(args)?.canonical_artifacts(&run_id)?;
            let matrix = TraceabilityMatrix::build(&artifacts);
            if args.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&matrix.to_content())?);
            } else {
                print!("{}", matrix.render_table());
            }
            Ok(0)
        }
        Some(("validate-config", args)) => {
            let path = args
                .get_one::<PathBuf>("file")
                .context("configuration file is required")?;
            let config = PipelineConfig::from_yaml_file(path)?;
            println!(
                "{}: ok ({} state(s), policy {})",
                config.name,
                config.states.len(),
                config.policy_version
            );
            Ok(0)
        }
        _ => bail!("unknown command"),
    }
}

fn load_config(args: &ArgMatches) -> Result<PipelineConfig> {
    let mut config = match args.get_one::<PathBuf>("config") {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = args.get_one::<PathBuf>("runs-dir") {
        config = config.with_runs_directory(dir.clone());
    }
    Ok(config)
}

fn store(args: &ArgMatches) -> Result<ArtifactStore> {
    Ok(ArtifactStore::new(load_config(args)?.runs_directory))
}

fn orchestrator(args: &ArgMatches) -> Result<Orchestrator> {
    if !args.get_flag("dry-run") {
        bail!("no model backend is built into this binary; pass --dry-run to use the deterministic executor");
    }
    Ok(Orchestrator::new(load_config(args)?, ExecutorRegistry::dry_run()))
}

fn parse_run_id(args: &ArgMatches, name: &str) -> Result<RunId> {
    let raw = args
        .get_one::<String>(name)
        .with_context(|| format!("{name} is required"))?;
    raw.parse().with_context(|| format!("invalid run id {raw:?}"))
}

/// Cancel the run on Ctrl-C; the orchestrator records the stop itself
async fn with_ctrl_c<F, E>(orchestrator: &Orchestrator, run: F) -> Result<RunOutcome>
where
    F: std::future::Future<Output = Result<RunOutcome, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let token = orchestrator.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            token.cancel();
        }
    });
    let outcome = run.await;
    watcher.abort();
    Ok(outcome?)
}

fn report(outcome: &RunOutcome) -> u8 {
    info!(
        run_id = %outcome.run_id,
        state = %outcome.final_state,
        artifacts = outcome.artifacts.len(),
        elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
        "run ended"
    );
    println!("{}\t{}", outcome.run_id, outcome.final_state);
    if let Some(reason) = &outcome.stop_reason {
        eprintln!("stopped: {reason}");
    }
    u8::try_from(outcome.exit_code()).unwrap_or(EXIT_ERROR)
}

fn error_kind(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<OrchestratorError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<DerivedRunError>() {
            return e.kind();
        }
        if let Some(e) = cause.downcast_ref::<specrun_artifact::StoreError>() {
            return e.kind();
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return "config";
        }
    }
    "error"
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn global_flags_reach_subcommands() {
        let matches = cli()
            .try_get_matches_from(["specrun", "resume", "20260101_120000_abcd1234", "--dry-run", "--break-lock"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "resume");
        assert!(args.get_flag("dry-run"));
        assert!(args.get_flag("break-lock"));
    }

    #[test]
    fn runs_dir_overrides_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let matches = cli()
            .try_get_matches_from(["specrun", "trace", "x", "--runs-dir", dir.path().to_str().unwrap()])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(load_config(args).unwrap().runs_directory, dir.path());
    }

    #[test]
    fn run_without_backend_is_refused() {
        let matches = cli()
            .try_get_matches_from(["specrun", "run", "--input", "feature.txt"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert!(orchestrator(args).is_err());
    }

    #[test]
    fn error_kind_finds_wrapped_errors() {
        let err = anyhow::Error::new(DerivedRunError::BaseRunMismatch {
            expected: RunId::generate(),
            found: RunId::generate(),
        })
        .context("deriving");
        assert_eq!(error_kind(&err), "base_run_mismatch");
        assert_eq!(error_kind(&anyhow::anyhow!("plain")), "error");
    }

    #[tokio::test]
    async fn dry_run_end_to_end_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("feature.txt");
        std::fs::write(&input, "Build a task tracker with due dates and reminders").unwrap();
        let runs = dir.path().join("runs");
        let matches = cli()
            .try_get_matches_from([
                "specrun",
                "run",
                "--dry-run",
                "--input",
                input.to_str().unwrap(),
                "--runs-dir",
                runs.to_str().unwrap(),
            ])
            .unwrap();

        assert_eq!(dispatch(&matches).await.unwrap(), 0);
        assert_eq!(std::fs::read_dir(&runs).unwrap().count(), 1);
    }
}
