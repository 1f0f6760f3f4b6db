//! Store invariants against an in-memory SQLite database.

use burnish_core::db::Store;
use burnish_core::types::{
    Category, RunStatus, RunType, StepKind, StepStatus, Ticket, TicketMetadata, TicketStatus,
};
use chrono::Utc;

fn open_store() -> Store {
    let store = Store::open(":memory:").expect("open in-memory db");
    store.migrate().expect("migrate");
    store
}

fn make_ticket(project_id: i64, title: &str) -> Ticket {
    Ticket {
        id: 0,
        project_id,
        title: title.into(),
        description: "desc".into(),
        category: Category::Refactor,
        status: TicketStatus::Ready,
        allowed_paths: vec!["src/**".into()],
        forbidden_paths: vec!["config/**".into()],
        verification_commands: vec!["cargo test".into()],
        metadata: TicketMetadata {
            scout_confidence: Some(70),
            estimated_complexity: None,
            formula: Some("balanced".into()),
        },
        created_at: Utc::now(),
    }
}

#[test]
fn project_upsert_is_idempotent() {
    let store = open_store();
    let a = store.upsert_project("repo", "/repo").expect("upsert");
    let b = store.upsert_project("repo", "/repo").expect("upsert");
    assert_eq!(a.id, b.id);
}

#[test]
fn ticket_round_trips_json_columns() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    let id = store
        .insert_ticket(&make_ticket(project.id, "Round trip"))
        .expect("insert");
    let loaded = store.get_ticket(id).expect("get").expect("some");
    assert_eq!(loaded.allowed_paths, vec!["src/**".to_string()]);
    assert_eq!(loaded.forbidden_paths, vec!["config/**".to_string()]);
    assert_eq!(loaded.verification_commands, vec!["cargo test".to_string()]);
    assert_eq!(loaded.metadata.scout_confidence, Some(70));
    assert_eq!(loaded.metadata.formula.as_deref(), Some("balanced"));
}

#[test]
fn ticket_without_allowed_paths_is_rejected() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    let mut ticket = make_ticket(project.id, "No scope");
    ticket.allowed_paths.clear();
    assert!(store.insert_ticket(&ticket).is_err());
}

#[test]
fn at_most_one_active_run_per_ticket() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    let ticket_id = store
        .insert_ticket(&make_ticket(project.id, "Single run"))
        .expect("insert");

    let run = store
        .insert_run(project.id, RunType::Worker, Some(ticket_id))
        .expect("first run");
    assert!(store
        .insert_run(project.id, RunType::Worker, Some(ticket_id))
        .is_err());

    store
        .finish_run(run, RunStatus::Failure, Some("boom"))
        .expect("finish");
    // A finished run frees the slot.
    store
        .insert_run(project.id, RunType::Worker, Some(ticket_id))
        .expect("second run");
}

#[test]
fn stale_tickets_reset_only_without_active_run() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    let stranded = store
        .insert_ticket(&make_ticket(project.id, "Stranded"))
        .expect("insert");
    let active = store
        .insert_ticket(&make_ticket(project.id, "Active"))
        .expect("insert");
    store
        .update_ticket_status(stranded, TicketStatus::InProgress)
        .expect("status");
    store
        .update_ticket_status(active, TicketStatus::InProgress)
        .expect("status");
    store
        .insert_run(project.id, RunType::Worker, Some(active))
        .expect("run");

    let reset = store.reset_stale_tickets().expect("reset");
    assert_eq!(reset, 1);
    assert_eq!(
        store.get_ticket(stranded).expect("get").expect("t").status,
        TicketStatus::Ready
    );
    assert_eq!(
        store.get_ticket(active).expect("get").expect("t").status,
        TicketStatus::InProgress
    );
}

#[test]
fn run_steps_keep_order_and_status() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    let run = store
        .insert_run(project.id, RunType::Session, None)
        .expect("run");
    for (i, name) in ["worktree", "agent", "qa"].iter().enumerate() {
        let step = store
            .add_step(run, i as i64 + 1, name, StepKind::Internal)
            .expect("step");
        store
            .finish_step(step, StepStatus::Success, 5, None)
            .expect("finish");
    }
    let steps = store.list_steps(run).expect("list");
    assert_eq!(steps.len(), 3);
    assert!(steps.windows(2).all(|w| w[0].ordinal < w[1].ordinal));
    assert!(steps.iter().all(|s| s.status == StepStatus::Success));
}

#[test]
fn open_titles_cover_ready_and_leased() {
    let store = open_store();
    let project = store.upsert_project("repo", "/repo").expect("upsert");
    for (title, status) in [
        ("Ready one", TicketStatus::Ready),
        ("Leased one", TicketStatus::Leased),
        ("Done one", TicketStatus::Done),
    ] {
        let id = store
            .insert_ticket(&make_ticket(project.id, title))
            .expect("insert");
        store.update_ticket_status(id, status).expect("status");
    }
    let titles = store.open_ticket_titles().expect("titles");
    assert_eq!(titles, vec!["Ready one".to_string(), "Leased one".to_string()]);
}
