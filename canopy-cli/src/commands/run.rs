use crate::config::{CliConfig, RuntimeKind};
use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use tracing::warn;

use canopy_engine::runners::{ContainerConfig, LocalRuntimeConfig};
use canopy_engine::{
    progress_channel, DataStore, DefinitionParser, DockerRuntime, EngineConfig, FsStore,
    LocalRuntime, MemoryStore, NodeState, OperatorCommand, Run, RunEvent, Runtime,
};

/// Run a pipeline definition
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the definition YAML file
    pub definition: PathBuf,

    /// Runtime executing the leaves
    #[arg(long, value_enum, value_name = "KIND")]
    pub runtime: Option<RuntimeKind>,

    /// Skip the node at PATH (can be repeated)
    #[arg(long = "skip", value_name = "PATH")]
    pub skip: Vec<String>,

    /// Parent directory of the per-scope working directories
    #[arg(long, short = 'w', value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Persist the data store under DIR instead of in memory
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Run identifier (default: generated)
    #[arg(long, value_name = "ID")]
    pub run_id: Option<String>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs, config: &CliConfig) -> Result<()> {
    let path = &args.definition;
    if !path.exists() {
        bail!("Definition file not found: {}", path.display());
    }

    output::status("Loading", &format!("{}", path.display()));
    let definition = DefinitionParser::from_file(path)?;
    let name = definition.name.clone().unwrap_or_else(|| {
        path.file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("pipeline")
            .to_string()
    });

    let mut engine_config = EngineConfig::default().with_poll_interval(config.poll_interval());
    if let Some(run_id) = &args.run_id {
        engine_config = engine_config.with_run_id(run_id.clone());
    }
    let run_id = engine_config.run_id.clone();

    let runtime = build_runtime(&args, config).await?;
    let store: Arc<dyn DataStore> = match args.data_dir.as_ref().or(config.data_dir.as_ref()) {
        Some(dir) => Arc::new(FsStore::new(dir, run_id.clone())),
        None => Arc::new(MemoryStore::new()),
    };

    let (tx, mut rx) = progress_channel();
    let run = Run::new(definition.root, runtime)
        .with_config(engine_config)
        .with_store(store)
        .with_progress(tx);

    for skip in &args.skip {
        run.apply(OperatorCommand::SetSkip {
            path: skip.clone(),
            skip: true,
        })
        .await
        .wrap_err_with(|| format!("cannot skip '{}'", skip))?;
        run.apply(OperatorCommand::Reset { path: skip.clone() })
            .await?;
    }

    output::info(&format!("Pipeline '{}' as run {}", name, run_id));

    let control = run.control();
    let exec_handle = tokio::spawn(async move {
        let result = run.execute().await;
        if let Err(err) = run.shutdown().await {
            warn!(error = %err, "runtime shutdown failed");
        }
        result
    });

    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                output::warning("Interrupted, killing the run");
                control.kill("/");
            }
        }
    }

    let report = exec_handle.await??;

    if !report.failures.is_empty() {
        println!();
        output::error(&format!("{} node(s) failed:", report.failures.len()));
        for failure in &report.failures {
            let detail = failure
                .message
                .clone()
                .or_else(|| failure.exit_code.map(|c| format!("exit code {}", c)))
                .unwrap_or_default();
            output::failure(&format!("{} {}", failure.path, detail));
        }
    }

    if args.json {
        println!("{}", report.to_json()?);
    }

    if !report.succeeded() {
        std::process::exit(1);
    }

    Ok(())
}

async fn build_runtime(args: &RunArgs, config: &CliConfig) -> Result<Arc<dyn Runtime>> {
    let work_dir = args.work_dir.as_ref().or(config.work_dir.as_ref());

    match args.runtime.unwrap_or(config.runtime) {
        RuntimeKind::Local => {
            let mut local = LocalRuntimeConfig::default();
            if let Some(dir) = work_dir {
                local.work_root = dir.clone();
            }
            Ok(Arc::new(LocalRuntime::with_config(local)))
        }
        RuntimeKind::Docker => {
            let mut container = ContainerConfig {
                auto_remove: !config.keep_containers,
                ..ContainerConfig::default()
            };
            if let Some(dir) = work_dir {
                container.work_root = dir.clone();
            }
            if let Some(image) = &config.default_image {
                container.default_image = image.clone();
            }
            let runtime = DockerRuntime::with_config(container);
            if !runtime.is_available().await {
                bail!("Docker is not available; install it or use --runtime local");
            }
            Ok(Arc::new(runtime))
        }
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { run_id, total_nodes } => {
            println!();
            output::header(&format!("Run {} ({} nodes)", run_id, total_nodes));
        }

        RunEvent::NodeStateChanged { path, to, .. } => match to {
            NodeState::Running => output::status("Running", path),
            NodeState::Skipped => output::dim(&format!("         {} skipped", path)),
            NodeState::Killed => output::warning(&format!("{} killed", path)),
            _ => {}
        },

        RunEvent::LazyExpanded { path, children } => {
            output::info(&format!("{} expanded into {} node(s)", path, children));
        }

        RunEvent::LeafExited {
            path,
            scope,
            exit_code,
            duration,
        } => output::leaf_exit(path, scope, *exit_code, *duration),

        RunEvent::RunFinished {
            state, duration, ..
        } => {
            println!();
            if *state == NodeState::Done {
                output::success(&format!(
                    "Run completed successfully in {:.2}s",
                    duration.as_secs_f64()
                ));
            } else {
                output::failure(&format!(
                    "Run ended {} after {:.2}s",
                    state,
                    duration.as_secs_f64()
                ));
            }
        }
    }
}
