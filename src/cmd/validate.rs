use clap::Parser;
use shrike::output;
use shrike::planner;
use shrike::template::Template;
use shrike::workflow::{self, TaskKind, WorkflowDefinition, WorkflowTask};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Definition error: {source}"))]
    Workflow { source: workflow::Error },

    #[snafu(display("{count} workflow(s) failed validation"))]
    ValidationFailed { count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Workflow definition file(s) (YAML)
    #[arg(required = true, value_name = "WORKFLOW")]
    pub workflows: Vec<PathBuf>,

    /// Task definitions file to resolve task references against
    #[arg(short = 't', long, value_name = "PATH")]
    pub tasks: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

pub async fn handle_validate(args: ValidateArgs) -> Result<()> {
    let task_defs = match &args.tasks {
        Some(path) => Some(workflow::load_task_file(path).context(WorkflowSnafu)?),
        None => None,
    };

    let mut failures = 0usize;
    for path in &args.workflows {
        let display = path.display().to_string();
        match workflow::load_workflow_file(path) {
            Ok(definition) => {
                let errors = validate_workflow(&definition, task_defs.as_deref());
                if errors.is_empty() {
                    output::format_validation_ok(&display);
                } else {
                    output::format_validation_errors(&display, &errors);
                    failures += 1;
                }
            }
            Err(e) => {
                output::format_validation_errors(&display, &[e.to_string()]);
                failures += 1;
            }
        }
    }

    if failures == 0 {
        Ok(())
    } else {
        Err(Error::ValidationFailed { count: failures })
    }
}

/// Static checks: the plan compiles (ids, dependencies, cycles,
/// input templates), every output template parses, timeouts parse,
/// and, when task definitions are available, every reference resolves
/// and its request templates parse.
fn validate_workflow(
    definition: &WorkflowDefinition,
    task_defs: Option<&[WorkflowTask]>,
) -> Vec<String> {
    let mut errors = Vec::new();

    if let Err(e) = planner::plan(definition) {
        errors.push(e.to_string());
    }

    if let Some(timeout) = &definition.timeout {
        if let Err(e) = workflow::parse_duration(timeout) {
            errors.push(e.to_string());
        }
    }
    for task in &definition.tasks {
        if let Some(timeout) = &task.timeout {
            if let Err(e) = workflow::parse_duration(timeout) {
                errors.push(format!("task '{}': {e}", task.id));
            }
        }
    }

    for (key, expr) in &definition.output {
        if let Err(e) = Template::parse(expr) {
            errors.push(format!("output '{key}': {e}"));
        }
    }

    if let Some(task_defs) = task_defs {
        let known: HashSet<&str> = task_defs.iter().map(|t| t.name.as_str()).collect();
        for task in &definition.tasks {
            if !known.contains(task.task_ref.as_str()) {
                errors.push(format!(
                    "task '{}' references unknown task definition '{}'",
                    task.id, task.task_ref
                ));
            }
        }
        for def in task_defs {
            errors.extend(validate_task_templates(def));
        }
    }

    errors
}

fn validate_task_templates(def: &WorkflowTask) -> Vec<String> {
    let mut errors = Vec::new();
    let mut check = |label: &str, text: &str| {
        if let Err(e) = Template::parse(text) {
            errors.push(format!("task definition '{}' {label}: {e}", def.name));
        }
    };
    match &def.kind {
        TaskKind::Http(http) => {
            check("method", &http.method);
            check("url", &http.url);
            for (name, value) in &http.headers {
                check(&format!("header '{name}'"), value);
            }
        }
        TaskKind::Websocket(ws) => check("url", &ws.url),
        TaskKind::Transform(_) => {}
    }
    errors
}
