use std::path::Path;
use std::thread;
use std::time::Duration;

use super::control::{eta_seconds, progress_percent};
use super::service::validate_test_id;
use super::*;
use crate::model::JobState;
use crate::settings::PipelineSettings;

fn service(root: &Path) -> JobService {
    let mut settings = PipelineSettings::default();
    settings.control.poll_interval_ms = 5;
    JobService::new(root, settings)
}

fn create_job(service: &JobService, test_id: &str) -> String {
    service
        .create(test_id, Path::new("scan.pdf"), Path::new("roster.csv"))
        .expect("job should be created")
        .job_id
}

#[test]
fn new_job_starts_running_with_zero_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.state, JobState::Running);
    assert_eq!(report.progress_percent, 0);
    assert_eq!(report.eta_seconds, None);
    assert!(dir.path().join("jobs.sqlite").exists());
}

#[test]
fn create_records_absolute_input_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job = service
        .create("midterm", Path::new("scan.pdf"), Path::new("roster.csv"))
        .expect("job");

    assert!(Path::new(&job.document_path).is_absolute());
    assert!(job.roster_path.ends_with("roster.csv"));
}

#[test]
fn pause_and_resume_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    assert_eq!(service.pause(&job_id).expect("pause").state, JobState::Paused);
    assert_eq!(
        service.resume(&job_id).expect("resume").state,
        JobState::Running
    );
}

#[test]
fn resume_of_running_job_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    let err = service.resume(&job_id).expect_err("resume should fail");
    assert!(matches!(
        err,
        ControlError::InvalidTransition {
            action: ControlAction::Resume,
            state: JobState::Running,
            ..
        }
    ));
}

#[test]
fn cancelled_job_cannot_be_paused_or_resumed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    service.cancel(&job_id).expect("cancel");
    assert!(service.pause(&job_id).is_err());
    assert!(service.resume(&job_id).is_err());
    assert!(service.cancel(&job_id).is_err());

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.state, JobState::Cancelled);
}

#[test]
fn paused_job_can_be_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    service.pause(&job_id).expect("pause");
    assert_eq!(
        service.cancel(&job_id).expect("cancel").state,
        JobState::Cancelled
    );
}

#[test]
fn unknown_job_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());

    let err = service.pause("missing").expect_err("unknown job");
    assert!(matches!(err, ControlError::UnknownJob(id) if id == "missing"));
    assert!(service.status("missing").is_err());
}

#[test]
fn result_requires_completed_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    let err = service.result(&job_id).expect_err("running job has no result");
    assert!(matches!(
        err,
        ControlError::NotCompleted {
            state: JobState::Running,
            ..
        }
    ));

    let mut store = service.open_store().expect("store");
    store
        .complete(&job_id, Some("/out/presence.csv"), Some("/out/bundle.zip"))
        .expect("complete");

    let result = service.result(&job_id).expect("result");
    assert_eq!(result.presence_table_path.as_deref(), Some("/out/presence.csv"));
    assert_eq!(result.bundle_path.as_deref(), Some("/out/bundle.zip"));

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.progress_percent, 100);
    assert_eq!(report.eta_seconds, Some(0));
}

#[test]
fn failed_job_keeps_error_and_no_outputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    let mut store = service.open_store().expect("store");
    store.fail(&job_id, "roster missing").expect("fail");

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.error.as_deref(), Some("roster missing"));
    assert!(service.result(&job_id).is_err());
    assert!(store.complete(&job_id, None, None).is_err());
}

#[test]
fn progress_never_decreases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");
    let mut store = service.open_store().expect("store");

    let first = store
        .report_progress(&job_id, 5, 10, Duration::from_secs(10))
        .expect("progress");
    assert_eq!(first, 50);

    let second = store
        .report_progress(&job_id, 3, 10, Duration::from_secs(12))
        .expect("progress");
    assert_eq!(second, 50);

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.progress_percent, 50);
}

#[test]
fn progress_is_ignored_after_terminal_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");
    let mut store = service.open_store().expect("store");

    store.cancel(&job_id).expect("cancel");
    let stored = store
        .report_progress(&job_id, 9, 10, Duration::from_secs(1))
        .expect("progress");
    assert_eq!(stored, 0);
}

#[test]
fn progress_percent_handles_bounds() {
    assert_eq!(progress_percent(0, 0), 100);
    assert_eq!(progress_percent(0, 3), 0);
    assert_eq!(progress_percent(1, 3), 33);
    assert_eq!(progress_percent(3, 3), 100);
    assert_eq!(progress_percent(7, 3), 100);
}

#[test]
fn eta_extrapolates_from_completed_units() {
    assert_eq!(eta_seconds(0, 10, Duration::from_secs(5)), None);
    assert_eq!(eta_seconds(2, 10, Duration::from_secs(4)), Some(16));
    assert_eq!(eta_seconds(10, 10, Duration::from_secs(4)), Some(0));
}

#[test]
fn stale_jobs_are_failed_on_status_sweep() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");
    let mut store = service.open_store().expect("store");
    store.set_worker_pid(&job_id, 4242).expect("claim");

    assert!(
        store
            .fail_stale(Duration::from_secs(900))
            .expect("sweep")
            .is_empty()
    );

    thread::sleep(Duration::from_millis(5));
    let failed = store.fail_stale(Duration::ZERO).expect("sweep");
    assert_eq!(failed, vec![job_id.clone()]);

    let job = store.require(&job_id).expect("job");
    assert_eq!(job.state, JobState::Failed);
    assert!(job.error.unwrap_or_default().contains("stopped reporting"));
}

#[test]
fn queued_jobs_survive_the_stale_sweep_until_claimed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = PipelineSettings::default();
    settings.control.stale_after_secs = 0;
    let service = JobService::new(dir.path(), settings);
    let job_id = create_job(&service, "midterm");

    thread::sleep(Duration::from_millis(5));
    assert_eq!(
        service.status(&job_id).expect("status").state,
        JobState::Running
    );
    assert_eq!(service.list(None).expect("list")[0].state, JobState::Running);

    let mut store = service.open_store().expect("store");
    store.set_worker_pid(&job_id, 4242).expect("claim");
    thread::sleep(Duration::from_millis(5));

    let report = service.status(&job_id).expect("status");
    assert_eq!(report.state, JobState::Failed);
    assert!(report.error.unwrap_or_default().contains("stopped reporting"));
}

#[test]
fn list_filters_by_test_id() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let a = create_job(&service, "midterm");
    let _ = create_job(&service, "final");
    let c = create_job(&service, "midterm");

    let jobs = service.list(Some("midterm")).expect("list");
    let ids = jobs.iter().map(|job| job.job_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&a));
    assert!(ids.contains(&c));
    assert_eq!(service.list(None).expect("list").len(), 3);
}

#[test]
fn test_id_must_be_a_single_path_component() {
    assert!(validate_test_id("midterm-2024_a.1").is_ok());
    assert!(validate_test_id("").is_err());
    assert!(validate_test_id("..").is_err());
    assert!(validate_test_id("a/b").is_err());
    assert!(validate_test_id("a b").is_err());
}

#[test]
fn checkpoint_reports_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");

    let store = service.open_store().expect("store");
    let mut control = StoreControl::new(store, &job_id, Duration::from_millis(5));
    assert_eq!(
        control.checkpoint().expect("checkpoint"),
        CheckpointOutcome::Proceed
    );

    service.cancel(&job_id).expect("cancel");
    assert_eq!(
        control.checkpoint().expect("checkpoint"),
        CheckpointOutcome::Cancelled
    );
}

#[test]
fn checkpoint_blocks_until_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");
    service.pause(&job_id).expect("pause");

    let resumer = {
        let service = service.clone();
        let job_id = job_id.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            service.resume(&job_id).expect("resume");
        })
    };

    let store = service.open_store().expect("store");
    let mut control = StoreControl::new(store, &job_id, Duration::from_millis(5));
    assert_eq!(
        control.checkpoint().expect("checkpoint"),
        CheckpointOutcome::Proceed
    );
    resumer.join().expect("resumer thread");

    assert_eq!(
        service.status(&job_id).expect("status").state,
        JobState::Running
    );
}

#[test]
fn checkpoint_cancel_while_paused_stops() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = service(dir.path());
    let job_id = create_job(&service, "midterm");
    service.pause(&job_id).expect("pause");

    let canceller = {
        let service = service.clone();
        let job_id = job_id.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            service.cancel(&job_id).expect("cancel");
        })
    };

    let store = service.open_store().expect("store");
    let mut control = StoreControl::new(store, &job_id, Duration::from_millis(5));
    assert_eq!(
        control.checkpoint().expect("checkpoint"),
        CheckpointOutcome::Cancelled
    );
    canceller.join().expect("canceller thread");
}
