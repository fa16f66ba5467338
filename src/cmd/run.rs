use clap::Parser;
use shrike::circuit::CircuitRegistry;
use shrike::config::ShrikeConfig;
use shrike::engine::{EngineBuilder, ExecuteOptions};
use shrike::execution::ExecutionStatus;
use shrike::output;
use shrike::registry::InMemoryRegistry;
use shrike::schema;
use shrike::workflow;
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Definition error: {source}"))]
    Workflow { source: workflow::Error },

    #[snafu(display("Engine error: {source}"))]
    Engine { source: shrike::engine::Error },

    #[snafu(display("I/O error: {source}"))]
    Io { source: std::io::Error },

    #[snafu(display("Invalid input JSON: {source}"))]
    Json { source: serde_json::Error },

    #[snafu(display("Input validation failed for workflow '{workflow}'"))]
    InputInvalid { workflow: String },

    #[snafu(display("Workflow finished with status {status}"))]
    WorkflowFailed { status: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Workflow definition file (YAML)
    #[arg(required = true, value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// Task definitions file (YAML list of tasks)
    #[arg(short = 't', long, value_name = "PATH")]
    pub tasks: Option<PathBuf>,

    /// Input payload file (JSON); defaults to an empty object
    #[arg(short = 'i', long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Workflow timeout override, e.g. "30s"
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    /// Parallelism cap for this execution
    #[arg(short = 'p', long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Print the execution trace after the run
    #[arg(long)]
    pub trace: bool,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

pub async fn handle_run(args: RunArgs, config: ShrikeConfig) -> Result<()> {
    let workflow_def = workflow::load_workflow_file(&args.workflow).context(WorkflowSnafu)?;

    let registry = Arc::new(InMemoryRegistry::new());
    if let Some(tasks_path) = &args.tasks {
        for task in workflow::load_task_file(tasks_path).context(WorkflowSnafu)? {
            registry.register_task(task);
        }
    }

    let input: serde_json::Value = match &args.input {
        Some(path) => {
            let text = std::fs::read_to_string(path).context(IoSnafu)?;
            serde_json::from_str(&text).context(JsonSnafu)?
        }
        None => serde_json::json!({}),
    };

    // Edge-side validation: the engine itself does not re-validate.
    if let Some(input_schema) = &workflow_def.input {
        let validation = schema::validate_input(input_schema, &input);
        if !validation.valid {
            output::format_input_violations(&validation);
            return Err(Error::InputInvalid {
                workflow: workflow_def.name.clone(),
            });
        }
    }

    let timeout = match args.timeout.as_deref().or(config.run.timeout.as_deref()) {
        Some(t) => Some(workflow::parse_duration(t).context(WorkflowSnafu)?),
        None => None,
    };

    let engine = EngineBuilder::new()
        .with_definition_source(registry)
        .with_circuit_registry(Arc::new(CircuitRegistry::new(config.circuit_config())))
        .with_parallelism(args.parallelism.unwrap_or(config.engine.parallelism))
        .with_event_buffer_size(config.engine.event_buffer_size)
        .with_anomaly_factor(config.engine.anomaly_factor)
        .build();

    let options = ExecuteOptions {
        timeout,
        parallelism: None,
        env: None,
    };

    output::format_execution_start(&workflow_def.name);
    let (result, trace) = engine
        .execute(&workflow_def, input, options)
        .await
        .context(EngineSnafu)?;

    output::format_execution_result(&result);
    if args.trace || config.run.trace {
        output::format_trace(&trace);
    }

    match result.status {
        ExecutionStatus::Succeeded => Ok(()),
        other => Err(Error::WorkflowFailed {
            status: format!("{other:?}"),
        }),
    }
}
