use burnish_core::agent::{ExecuteRequest, ScoutRequest};

/// Output contract appended to every scout instruction. The engine parses
/// this with `event::parse_scout_output`.
const SCOUT_OUTPUT_CONTRACT: &str = r#"
Output EXACTLY one fenced json block of this shape and nothing after it:

```json
{"scanned_files": <number of files you examined>,
 "proposals": [
   {"category": "refactor|docs|test|perf|security|fix|cleanup|types",
    "title": "<short imperative title, max 80 chars>",
    "description": "<2-4 sentences: what to change and why>",
    "acceptance_criteria": ["<observable result>"],
    "verification_commands": ["<shell command>"],
    "allowed_paths": ["<glob>"],
    "files": ["<file the change touches>"],
    "confidence": <0-100>,
    "impact_score": <1-10>,
    "risk": "low|medium|high",
    "estimated_complexity": "trivial|simple|moderate|complex",
    "rollback_note": "<one sentence>"}
 ]}
```

Include "sector_reclassification": {"path", "production", "purpose"} in the
object only if this area is clearly mislabeled (e.g. generated or vendored).
Propose nothing outside the assigned scope."#;

const EXECUTE_OUTPUT_CONTRACT: &str = r#"
When finished, output EXACTLY one fenced json block:

```json
{"success": true|false,
 "completion_outcome": "no_changes_needed" (only when the code is already correct),
 "scope_expanded": true (only if you widened the ticket scope and stopped),
 "failure_reason": "qa_failed|scope_violation|agent_error" (on failure),
 "error": "<one-line cause>" (on failure),
 "changed_files": ["<path>"]}
```

Stay inside the allowed paths. Do not push, open PRs, or touch git config;
the engine owns delivery."#;

/// Build the scout instruction from the engine's structured request. First
/// explore, then propose; the prompt never embeds model-specific directives.
pub fn build_scout_instruction(req: &ScoutRequest) -> String {
    let mut s = String::new();
    s.push_str(
        "First, thoroughly explore the assigned slice of the codebase before suggesting \
         anything. Read key files, search for patterns, and understand the existing \
         architecture.\n\n",
    );
    s.push_str(&format!(
        "Scope: {} (stay strictly inside this glob).\n",
        req.scope
    ));
    if !req.categories.is_empty() {
        let cats: Vec<&str> = req.categories.iter().map(|c| c.as_str()).collect();
        s.push_str(&format!("Allowed categories: {}.\n", cats.join(", ")));
    }
    s.push_str(&format!(
        "Only propose work you estimate at confidence {} or higher. Propose at most {} items.\n",
        req.min_confidence, req.max_proposals
    ));

    if !req.baseline_failures.is_empty() {
        s.push_str(&format!(
            "\nHigh-priority healing targets: these QA commands already fail on the base \
             branch: {}. Fix proposals addressing them are especially valuable.\n",
            req.baseline_failures.join(", ")
        ));
    }

    if !req.recent_titles.is_empty() {
        s.push_str("\nRecently attempted work (do not re-propose):\n");
        for title in &req.recent_titles {
            s.push_str(&format!("- {title}\n"));
        }
    }

    if !req.learnings_block.is_empty() {
        s.push('\n');
        s.push_str(&req.learnings_block);
        s.push('\n');
    }

    for hint in &req.hints {
        s.push_str(&format!("\nHint: {hint}\n"));
    }

    if let Some(escalation) = &req.escalation {
        s.push_str(&format!("\n{escalation}\n"));
    }

    s.push_str(SCOUT_OUTPUT_CONTRACT);
    s
}

/// Build the execution instruction for one ticket attempt.
pub fn build_execute_instruction(req: &ExecuteRequest) -> String {
    let ticket = &req.ticket;
    let mut s = String::new();
    s.push_str(&format!("Ticket: {}\n\n{}\n", ticket.title, ticket.description));
    s.push_str(&format!("\nCategory: {}.\n", ticket.category.as_str()));

    s.push_str(&format!(
        "\nAllowed paths: {}.\n",
        req.constraints.allowed_paths.join(", ")
    ));
    if !req.constraints.denied_paths.is_empty() {
        s.push_str(&format!(
            "Forbidden paths: {}.\n",
            req.constraints.denied_paths.join(", ")
        ));
    }
    s.push_str(&format!(
        "Change at most {} files and roughly {} lines.\n",
        req.constraints.max_files, req.constraints.max_lines
    ));

    if !ticket.verification_commands.is_empty() {
        s.push_str(&format!(
            "\nVerification commands that must pass: {}.\n",
            ticket.verification_commands.join("; ")
        ));
    }

    if req.attempt > 0 {
        s.push_str(&format!(
            "\nThis is retry {} after a scope expansion; the allowed paths above are the \
             widened set.\n",
            req.attempt
        ));
    }

    if !req.learnings_block.is_empty() {
        s.push('\n');
        s.push_str(&req.learnings_block);
        s.push('\n');
    }

    s.push_str(EXECUTE_OUTPUT_CONTRACT);
    s
}

// ── Tests ──────────────────────────────────────────────────────────────────
