use chrono::{Duration, Utc};

use crate::account::AccountSnapshot;
use crate::payload::{Brand, EmailTemplate, SearchStrategy, TaskPayload};
use crate::task::{TaskRecord, TaskStatus, TaskType};

fn sample_record() -> TaskRecord {
    TaskRecord {
        task_id: "0000000001".to_string(),
        task_type: TaskType::Connect,
        status: TaskStatus::Pending,
        payload: TaskPayload {
            task_id: None,
            task_name: Some("spring".to_string()),
            region: "MX".to_string(),
            campaign_id: None,
            campaign_name: None,
            product_id: None,
            product_name: None,
            brand: Brand {
                name: "Acme".to_string(),
                only_first: 0,
                key_word: None,
            },
            search_strategy: SearchStrategy::default(),
            email_first: EmailTemplate {
                subject: "hi".to_string(),
                email_body: "body".to_string(),
            },
            email_later: None,
            max_creators: 500,
            target_new_creators: 50,
            run_at_time: None,
            run_end_time: None,
            extra: serde_json::Map::new(),
        },
        submitted_at: Utc::now(),
        run_at_time_display: None,
        run_at_time_utc: None,
        run_end_time_display: None,
        run_end_time_utc: None,
        started_at: None,
        finished_at: None,
        task_dir: "/data/acme/spring_0000000001".to_string(),
        created_by: "operator".to_string(),
        account_snapshot: None,
        new_creators: 0,
        total_creators: 0,
        latest_subject: None,
        output_files: Vec::new(),
        log_path: None,
        message: String::new(),
        control: Default::default(),
    }
}

#[test]
fn merge_output_files_is_sorted_and_deduped() {
    let mut record = sample_record();
    record.merge_output_files(["b.csv".to_string(), "a.csv".to_string()]);
    record.merge_output_files(["a.csv".to_string(), "c.csv".to_string()]);
    assert_eq!(record.output_files, vec!["a.csv", "b.csv", "c.csv"]);
}

#[test]
fn run_time_is_zero_before_start() {
    let record = sample_record();
    assert_eq!(record.run_time(Utc::now()), "00h00min00s");
}

#[test]
fn run_time_uses_finished_at_once_terminal() {
    let mut record = sample_record();
    let start = Utc::now() - Duration::seconds(125);
    record.started_at = Some(start);
    record.finished_at = Some(start + Duration::seconds(65));
    record.status = TaskStatus::Completed;
    assert_eq!(record.run_time(Utc::now()), "00h01min05s");
}

#[test]
fn terminal_statuses_match_spec_set() {
    assert!(TaskStatus::Completed.is_terminal());
    assert!(TaskStatus::Failed.is_terminal());
    assert!(TaskStatus::Cancelled.is_terminal());
    assert!(!TaskStatus::Running.is_terminal());
    assert!(!TaskStatus::ToBeCancel.is_terminal());
}

#[test]
fn snapshot_carries_account_email_once_acquired() {
    let mut record = sample_record();
    record.account_snapshot = Some(AccountSnapshot {
        name: "Acct1".to_string(),
        login_email: "acct1@example.com".to_string(),
        region: "MX".to_string(),
    });
    let snapshot = record.to_snapshot(Utc::now());
    assert_eq!(snapshot.account_email.as_deref(), Some("acct1@example.com"));
    assert_eq!(snapshot.brand_name, "Acme");
}
