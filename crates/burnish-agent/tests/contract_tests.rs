//! The prompt contract and the output parser must agree: a model that
//! follows the instruction's example shape produces output the parser
//! accepts.

use burnish_agent::event::{parse_outcome, parse_scout_output};
use burnish_agent::instruction::build_scout_instruction;
use burnish_core::agent::ScoutRequest;
use burnish_core::types::{Category, Complexity, FailureReason, Risk};

#[test]
fn contract_example_round_trips_through_parser() {
    let model_output = r#"I examined the routing layer.

```json
{"scanned_files": 17,
 "proposals": [
   {"category": "refactor",
    "title": "Extract route matching into its own module",
    "description": "The matcher is interleaved with handler dispatch.",
    "acceptance_criteria": ["matcher has its own unit tests"],
    "verification_commands": ["cargo test -p router"],
    "allowed_paths": ["src/router/**"],
    "files": ["src/router/mod.rs"],
    "confidence": 72,
    "impact_score": 6,
    "risk": "low",
    "estimated_complexity": "moderate",
    "rollback_note": "Revert the module split commit."}
 ]}
```"#;

    let report = parse_scout_output(model_output);
    assert_eq!(report.scanned_files, 17);
    assert_eq!(report.proposals.len(), 1);
    let p = &report.proposals[0];
    assert_eq!(p.category, Category::Refactor);
    assert_eq!(p.risk, Risk::Low);
    assert_eq!(p.estimated_complexity, Complexity::Moderate);
    assert_eq!(p.verification_commands, vec!["cargo test -p router".to_string()]);
}

#[test]
fn instruction_mentions_every_contract_field() {
    let req = ScoutRequest {
        repo_root: "/repo".into(),
        scope: "src/**".into(),
        sector_path: "src".into(),
        min_confidence: 30,
        max_proposals: 8,
        ..ScoutRequest::default()
    };
    let prompt = build_scout_instruction(&req);
    for field in [
        "scanned_files",
        "category",
        "confidence",
        "impact_score",
        "estimated_complexity",
        "rollback_note",
        "verification_commands",
    ] {
        assert!(prompt.contains(field), "missing {field}");
    }
}

#[test]
fn execute_contract_outcome_parses() {
    let model_output = r#"```json
{"success": false,
 "scope_expanded": false,
 "failure_reason": "qa_failed",
 "error": "cargo test: 2 failures",
 "changed_files": ["src/router/mod.rs", "src/router/matcher.rs"]}
```"#;
    let outcome = parse_outcome(model_output, true);
    assert!(!outcome.success);
    assert_eq!(outcome.failure_reason, Some(FailureReason::QaFailed));
    assert_eq!(outcome.changed_files.len(), 2);
}

#[test]
fn spindle_substructure_survives_parsing() {
    let model_output = r#"```json
{"success": false,
 "failure_reason": "spindle_abort",
 "error": "aborted by loop detector",
 "spindle": {"signal": "edit_revert_oscillation", "confidence": 0.95, "detail": "3 reverts"}}
```"#;
    let outcome = parse_outcome(model_output, false);
    let spindle = outcome.spindle.expect("spindle detail");
    assert_eq!(spindle.signal, "edit_revert_oscillation");
    assert!(spindle.confidence >= 0.9);
}
