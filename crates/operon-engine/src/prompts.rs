//! Prompt builders for agent-driven stages.
//!
//! Each builder is a pure function assembling one stage's prompt from
//! pipeline data. Wording stays minimal: structure and contracts (the
//! task-list JSON block, the review verdict marker) are what the engine
//! parses back out.

use operon_core::{MemoryEntry, PlannedTask, Task};

/// Marker an adversarial review emits when the plan needs rework.
pub const CHANGES_REQUESTED_MARKER: &str = "CHANGES_REQUESTED";

fn push_memory_section(prompt: &mut String, memory: &[MemoryEntry]) {
    if memory.is_empty() {
        return;
    }
    prompt.push_str("## PROJECT MEMORY\n\n");
    prompt.push_str("Decisions and discoveries from earlier runs:\n\n");
    for entry in memory {
        prompt.push_str(&format!("- [{}] {}\n", entry.kind, entry.content));
    }
    prompt.push('\n');
}

/// Build the planning prompt, optionally carrying review feedback from a
/// previous plan version.
pub fn plan_prompt(
    requirements: &str,
    human_feedback: Option<&str>,
    adversarial_feedback: Option<&str>,
    memory: &[MemoryEntry],
) -> String {
    let mut prompt = String::new();

    prompt.push_str("# PLAN THIS WORK\n\n");
    prompt.push_str("## REQUIREMENTS\n\n");
    prompt.push_str(requirements);
    prompt.push_str("\n\n");

    if let Some(feedback) = human_feedback {
        prompt.push_str("## REVIEWER FEEDBACK\n\n");
        prompt.push_str("A previous plan version was returned with this feedback. ");
        prompt.push_str("Address it in the new plan:\n\n");
        prompt.push_str(feedback);
        prompt.push_str("\n\n");
    }

    if let Some(feedback) = adversarial_feedback {
        prompt.push_str("## ADVERSARIAL REVIEW FINDINGS\n\n");
        prompt.push_str(feedback);
        prompt.push_str("\n\n");
    }

    push_memory_section(&mut prompt, memory);

    prompt.push_str("## OUTPUT FORMAT\n\n");
    prompt.push_str("Write the plan as markdown, then end with a fenced ```json block ");
    prompt.push_str("containing the task breakdown as a JSON array. Each task object:\n\n");
    prompt.push_str("```json\n");
    prompt.push_str("[{\"title\": \"...\", \"role\": \"backend|frontend|general\", ");
    prompt.push_str("\"prompt\": \"full instructions for the task agent\", ");
    prompt.push_str("\"depends_on\": [\"titles of prerequisite tasks\"], ");
    prompt.push_str("\"complexity\": \"simple|standard|complex\"}]\n");
    prompt.push_str("```\n\n");
    prompt.push_str("Tasks must be independently executable in separate working copies; ");
    prompt.push_str("express ordering only through depends_on.\n");

    prompt
}

/// Build the adversarial-review prompt for a plan.
pub fn adversarial_prompt(plan_content: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# ADVERSARIAL PLAN REVIEW\n\n");
    prompt.push_str("Attack this plan: missing requirements, hidden coupling between ");
    prompt.push_str("tasks, untestable steps, security gaps.\n\n");
    prompt.push_str("## PLAN\n\n");
    prompt.push_str(plan_content);
    prompt.push_str("\n\n## VERDICT\n\n");
    prompt.push_str("End your review with exactly one verdict line:\n\n");
    prompt.push_str("- `APPROVED` if the plan is sound\n");
    prompt.push_str(&format!(
        "- `{}: <your required changes>` otherwise\n",
        CHANGES_REQUESTED_MARKER
    ));

    prompt
}

/// Build the per-task execution prompt for a worktree agent.
pub fn task_prompt(task: &Task, memory: &[MemoryEntry]) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# TASK: {}\n\n", task.title));
    prompt.push_str(&format!("Role: {}\n\n", task.role));
    prompt.push_str(&task.prompt);
    prompt.push_str("\n\n");

    push_memory_section(&mut prompt, memory);

    prompt.push_str("## RULES\n\n");
    prompt.push_str("- You are in an isolated working copy on your own branch\n");
    prompt.push_str("- Commit your work with a descriptive message when done\n");
    prompt.push_str("- Do not touch files outside this task's scope\n");

    prompt
}

/// Build the testing-stage prompt covering every task worktree.
pub fn testing_prompt(tasks: &[Task]) -> String {
    let mut prompt = String::new();

    prompt.push_str("# RUN THE TEST SUITE\n\n");
    prompt.push_str("Run the project's tests in each task working copy below. ");
    prompt.push_str("Fix failures in place and commit the fixes.\n\n");
    for task in tasks {
        if let Some(path) = &task.worktree_path {
            prompt.push_str(&format!("- {}: {}\n", task.title, path.display()));
        }
    }
    prompt.push_str("\nReport PASS or FAIL per working copy at the end.\n");

    prompt
}

/// Build the code-review prompt covering every task branch.
pub fn code_review_prompt(tasks: &[Task]) -> String {
    let mut prompt = String::new();

    prompt.push_str("# CODE REVIEW\n\n");
    prompt.push_str("Review the diff of each task branch against its base. ");
    prompt.push_str("Fix real defects directly in the task's working copy and commit.\n\n");
    for task in tasks {
        let branch = task.branch.as_deref().unwrap_or("(no branch)");
        prompt.push_str(&format!("- {}: branch {}\n", task.title, branch));
    }

    prompt
}

/// Build the constrained prompt for an automated merge-conflict resolution run.
pub fn conflict_resolution_prompt(branch: &str, files: &[String], diff: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# RESOLVE MERGE CONFLICT\n\n");
    prompt.push_str(&format!(
        "A no-fast-forward merge of branch `{}` stopped on conflicts.\n\n",
        branch
    ));
    prompt.push_str("## CONFLICTED FILES\n\n");
    for file in files {
        prompt.push_str(&format!("- {}\n", file));
    }
    prompt.push_str("\n## DIFF EXCERPT\n\n");
    prompt.push_str("```\n");
    prompt.push_str(diff);
    prompt.push_str("\n```\n\n");
    prompt.push_str("Resolve every conflict marker, keep both sides' intent, ");
    prompt.push_str("then stage and commit the resolution. Do nothing else.\n");

    prompt
}

/// Build the evolution-capture analysis prompt from run statistics.
pub fn evolution_prompt(stats_lines: &[String], total_cost_usd: f64) -> String {
    let mut prompt = String::new();

    prompt.push_str("# PIPELINE RETROSPECTIVE\n\n");
    prompt.push_str(&format!("Total cost: ${:.2}\n\n", total_cost_usd));
    prompt.push_str("## RUN OUTCOMES\n\n");
    for line in stats_lines {
        prompt.push_str(&format!("- {}\n", line));
    }
    prompt.push_str("\nList patterns worth carrying forward and model/task pairings ");
    prompt.push_str("that under- or over-performed. Be concrete and brief.\n");

    prompt
}

/// Build the CLAUDE.md update prompt for the self-update worktree.
pub fn claude_md_prompt(requirements: &str, learnings: &str) -> String {
    let mut prompt = String::new();

    prompt.push_str("# UPDATE CLAUDE.md\n\n");
    prompt.push_str("Fold the learnings below into the repository's CLAUDE.md ");
    prompt.push_str("(create it if missing). Keep existing content that still holds; ");
    prompt.push_str("merge, don't append blindly. Commit the result.\n\n");
    prompt.push_str("## COMPLETED WORK\n\n");
    prompt.push_str(requirements);
    prompt.push_str("\n\n## LEARNINGS\n\n");
    prompt.push_str(learnings);
    prompt.push('\n');

    prompt
}

/// Extract the task breakdown from a planning transcript.
///
/// Scans fenced ```json blocks in order and returns the first one that
/// parses as a task array. Returns None when no block parses, leaving
/// the fallback to the caller.
pub fn parse_planned_tasks(transcript: &str) -> Option<Vec<PlannedTask>> {
    let mut rest = transcript;
    while let Some(start) = rest.find("```json") {
        let body = &rest[start + "```json".len()..];
        let Some(end) = body.find("```") else {
            return None;
        };
        if let Ok(tasks) = serde_json::from_str::<Vec<PlannedTask>>(body[..end].trim()) {
            if !tasks.is_empty() {
                return Some(tasks);
            }
        }
        rest = &body[end + 3..];
    }
    None
}

/// Extract required changes from an adversarial-review transcript.
///
/// Returns Some(feedback) when the verdict marker is present, None for
/// an approval.
pub fn parse_adversarial_feedback(transcript: &str) -> Option<String> {
    let pos = transcript.find(CHANGES_REQUESTED_MARKER)?;
    let after = &transcript[pos + CHANGES_REQUESTED_MARKER.len()..];
    let feedback = after.trim_start_matches([':', '*', '`']).trim();
    if feedback.is_empty() {
        Some("Changes requested without detail".to_string())
    } else {
        Some(feedback.to_string())
    }
}
