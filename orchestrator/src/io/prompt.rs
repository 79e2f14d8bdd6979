//! Executor prompt rendering.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::Task;

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("task", TASK_TEMPLATE)
        .expect("task template should be valid");
    env
});

#[derive(Debug, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    title: &'a str,
    description: &'a str,
    acceptance_criteria: &'a [String],
}

/// Inputs for one executor prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub task: &'a Task,
    /// Notes published by other workers, see `SharedKnowledge`.
    pub shared_context: &'a str,
    /// Why the previous attempt was rolled back, on retries.
    pub previous_failure: Option<&'a str>,
}

pub fn render_task_prompt(input: PromptInputs<'_>) -> Result<String> {
    let task = input.task;
    let description = if task.description.trim().is_empty() {
        task.display_title()
    } else {
        task.description.trim()
    };
    let template = ENGINE.get_template("task").context("load task template")?;
    let rendered = template
        .render(context! {
            task => TaskContext {
                id: &task.id,
                title: task.display_title(),
                description,
                acceptance_criteria: &task.acceptance_criteria,
            },
            shared_context => Some(input.shared_context.trim()).filter(|s| !s.is_empty()),
            previous_failure => input.previous_failure.map(str::trim).filter(|s| !s.is_empty()),
        })
        .with_context(|| format!("render prompt for {}", task.id))?;
    Ok(rendered)
}
