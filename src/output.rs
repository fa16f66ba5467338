//! Pretty output formatting for the CLI.

use crate::context::TaskStatus;
use crate::execution::{ExecutionResult, ExecutionStatus};
use crate::schema::InputValidationResult;
use crate::trace::Trace;
use console::style;
use serde_json::Value;

/// Format a workflow execution start header.
pub fn format_execution_start(workflow_name: &str) {
    println!("\n{}", "═".repeat(72));
    println!(
        "{} {} {}",
        style("▶").cyan().bold(),
        style("Workflow:").bold(),
        style(workflow_name).cyan().bold()
    );
    println!("{}", "─".repeat(72));
}

/// Format the terminal result of an execution.
pub fn format_execution_result(result: &ExecutionResult) {
    println!("\n{}", "═".repeat(72));
    match result.status {
        ExecutionStatus::Succeeded => {
            println!("{}", style("Workflow Succeeded").green().bold());
        }
        ExecutionStatus::Failed => println!("{}", style("Workflow Failed").red().bold()),
        ExecutionStatus::Cancelled => {
            println!("{}", style("Workflow Cancelled").yellow().bold());
        }
        ExecutionStatus::Running => println!("{}", style("Workflow Running").bold()),
    }
    println!(
        "  {} {}  {} {}ms",
        style("Execution:").dim(),
        style(&result.execution_id).dim(),
        style("Duration:").dim(),
        result.duration_ms
    );
    println!("{}", "─".repeat(72));

    for detail in &result.task_details {
        let symbol = match detail.status {
            TaskStatus::Succeeded => style("✓").green(),
            TaskStatus::Failed => style("✗").red(),
            TaskStatus::Cancelled => style("−").yellow(),
            TaskStatus::Pending | TaskStatus::Running => style("…").dim(),
        };
        let mut line = format!(
            "  {} {} {} {}ms",
            symbol,
            style(&detail.task_id).bold(),
            style(format!("[{}]", detail.task_ref)).dim(),
            detail.duration_ms
        );
        if detail.retry_count > 0 {
            line.push_str(&format!(" ({} retries)", detail.retry_count));
        }
        println!("{line}");
        if let Some(error) = &detail.error {
            println!(
                "      {} {}",
                style(format!("{:?}:", error.error_type)).red(),
                error.message
            );
            if let Some(suggestion) = &error.suggestion {
                println!("      {} {}", style("hint:").dim(), suggestion);
            }
        }
    }

    if let Some(output) = &result.output {
        println!("\n{}", style("Output").bold());
        println!("{}", "┄".repeat(72));
        println!("{}", indent_json(output, 2));
    }
    println!("{}", "═".repeat(72));
}

/// Format the execution trace: planned vs. actual parallelism plus
/// per-task timing.
pub fn format_trace(trace: &Trace) {
    println!("\n{}", style("Trace").bold());
    println!("{}", "┄".repeat(72));
    println!(
        "  {} {}",
        style("planned groups:").dim(),
        format_groups(&trace.planned_parallel_groups)
    );
    println!(
        "  {} {}",
        style("actual groups: ").dim(),
        format_groups(&trace.actual_parallel_groups)
    );
    for timing in &trace.task_timings {
        let mut line = format!(
            "  {} start+{}ms run {}ms",
            style(&timing.task_id).bold(),
            timing.wait_time_ms,
            timing.duration_ms
        );
        if !timing.waited_for.is_empty() {
            line.push_str(&format!(" (after {})", timing.waited_for.join(", ")));
        }
        println!("{line}");
    }
}

fn format_groups(groups: &[Vec<String>]) -> String {
    groups
        .iter()
        .map(|g| format!("[{}]", g.join(", ")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format edge-validation failures for an invocation payload.
pub fn format_input_violations(result: &InputValidationResult) {
    println!("{}", style("Input validation failed").red().bold());
    for violation in &result.violations {
        let field = if violation.field.is_empty() {
            "(root)".to_string()
        } else {
            violation.field.clone()
        };
        println!("  {} {}", style(field).bold(), violation.message);
    }
}

/// Format a validation success line.
pub fn format_validation_ok(path: &str) {
    println!("{} {}", style("✓").green().bold(), path);
}

/// Format validation failures for one file.
pub fn format_validation_errors(path: &str, errors: &[String]) {
    println!("{} {}", style("✗").red().bold(), style(path).bold());
    for error in errors {
        println!("    {error}");
    }
}

fn indent_json(value: &Value, spaces: usize) -> String {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    let pad = " ".repeat(spaces);
    rendered
        .lines()
        .map(|line| format!("{pad}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}
