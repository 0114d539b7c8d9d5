//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Plan and execute a task
//! - history: Show last N tasks

use anyhow::{bail, Context, Result};
use sdk::errors::CadenceErrorExt;
use std::sync::Arc;

use crate::backend::http::HttpBackend;
use crate::config::Config;
use crate::db::{Database, TaskRepository};
use crate::events::{EventBus, StepEventKind};
use crate::workflow::{
    ContextCompactor, ExecutionContext, ExecutionMode, Executor, Planner, StepStatus, Task,
    TaskStatus, TaskType,
};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Plan and execute a task
pub async fn handle_run(
    description: String,
    task_type: String,
    mode: Option<String>,
    plan_with_model: bool,
    dry_run: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let declared_type = TaskType::parse(&task_type)
        .with_context(|| format!("Unknown task type: {}", task_type))?;
    let mode_override = match mode {
        Some(name) => {
            Some(ExecutionMode::parse(&name).with_context(|| format!("Unknown mode: {}", name))?)
        }
        None => None,
    };

    let backend: Arc<HttpBackend> = Arc::new(
        HttpBackend::new(
            config.backend.base_url.clone(),
            config.backend.model.clone(),
            config.backend.timeout_secs,
        )
        .context("Failed to create step backend")?,
    );

    let planner = if plan_with_model {
        Planner::with_backend(backend.clone())
    } else {
        Planner::new()
    };

    let task = match planner.plan(&description, declared_type, mode_override).await {
        Ok(task) => task,
        Err(e) => {
            eprintln!("{}", e.user_hint());
            return Err(e.into());
        }
    };

    if dry_run {
        print_plan(&task, format)?;
        return Ok(());
    }

    let events = EventBus::new();
    let mut progress = events.subscribe().await;
    let printer = match format {
        OutputFormat::Text => Some(tokio::spawn(async move {
            while let Some(event) = progress.recv().await {
                match event.kind {
                    StepEventKind::Started => {
                        println!("  -> {} ({}) started", event.step_id, event.role)
                    }
                    StepEventKind::Completed => {
                        println!("  -> {} ({}) completed", event.step_id, event.role)
                    }
                    StepEventKind::Failed => println!(
                        "  -> {} ({}) failed: {}",
                        event.step_id,
                        event.role,
                        event.error.unwrap_or_default()
                    ),
                    StepEventKind::Created => {}
                }
            }
        })),
        OutputFormat::Json => None,
    };

    let (mut ctx, _cancel) = ExecutionContext::new(events, config.executor.max_concurrent_steps);

    // Persistence is optional: open it when enabled, run without it on
    // failure
    let _database;
    if config.persistence.enabled {
        match Database::new(&config.db_path()).await {
            Ok(db) => {
                let repository = Arc::new(TaskRepository::new(db.pool().clone()));
                ctx = ctx.with_repository(repository);
                _database = Some(db);
            }
            Err(e) => {
                tracing::warn!("Task history unavailable: {}", e);
                _database = None;
            }
        }
    } else {
        _database = None;
    }

    let executor = Executor::new(
        backend,
        ContextCompactor::new(config.executor.context_budget),
    )
    .with_retry_transient(config.executor.retry_transient);

    let task = executor.run(task, &ctx).await?;

    drop(ctx);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    print_result(&task, format)
}

/// Show recent tasks from the history database
pub async fn handle_history(limit: i64, config: &Config, format: OutputFormat) -> Result<()> {
    if !config.persistence.enabled {
        bail!("Task history is disabled in the configuration");
    }

    let db = Database::new(&config.db_path())
        .await
        .context("Failed to open task history database")?;
    let repository = TaskRepository::new(db.pool().clone());
    let records = repository.recent_tasks(limit).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No tasks recorded yet");
                return Ok(());
            }
            for record in records {
                println!(
                    "{}  [{:>9}]  {}  ({} tokens, ${:.4})",
                    &record.id[..8.min(record.id.len())],
                    record.status,
                    record.description,
                    record.total_tokens,
                    record.cost
                );
            }
        }
    }

    Ok(())
}

/// Print a planned workflow without executing it
fn print_plan(task: &Task, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&task.workflow)?);
        }
        OutputFormat::Text => {
            println!(
                "Workflow: {} mode, {:?} complexity",
                task.workflow.mode.as_str(),
                task.workflow.complexity
            );
            for step in &task.workflow.steps {
                let deps = if step.dependencies.is_empty() {
                    String::new()
                } else {
                    format!("  <- {}", step.dependencies.join(", "))
                };
                let optional = if step.optional { " (optional)" } else { "" };
                println!(
                    "  {} [{}]{} {}{}",
                    step.id, step.role, optional, step.instruction, deps
                );
                if let Some(constraints) = &step.constraints {
                    println!("      constraints: {}", constraints);
                }
            }
        }
    }
    Ok(())
}

/// Print a terminal task: status, result or failing step, partial results
fn print_result(task: &Task, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(task)?);
        }
        OutputFormat::Text => {
            println!();
            match task.status {
                TaskStatus::Completed => {
                    println!("Task completed");
                    if let Some(result) = &task.result {
                        println!("\n{}", result);
                    }
                }
                TaskStatus::Failed => {
                    println!("Task failed");
                    if let Some(failed) = task
                        .workflow
                        .steps
                        .iter()
                        .find(|s| s.status == StepStatus::Failed && !s.optional)
                    {
                        println!(
                            "  step {} ({}): {}",
                            failed.id,
                            failed.role,
                            failed.error.as_deref().unwrap_or("unknown error")
                        );
                    } else if let Some(error) = &task.error {
                        println!("  {}", error);
                    }

                    // Completed work is not hidden by a later failure
                    let completed: Vec<_> = task
                        .workflow
                        .steps
                        .iter()
                        .filter(|s| s.status == StepStatus::Completed)
                        .collect();
                    if !completed.is_empty() {
                        println!("\nCompleted steps:");
                        for step in completed {
                            let summary = step
                                .context
                                .as_ref()
                                .map(|c| c.summary.as_str())
                                .unwrap_or("");
                            println!("  {} ({}): {}", step.id, step.role, summary);
                        }
                    }
                }
                _ => println!("Task did not reach a terminal state"),
            }
            println!(
                "\nUsage: {} tokens, ${:.4}",
                task.usage.total_tokens(),
                task.usage.cost
            );
        }
    }
    Ok(())
}
