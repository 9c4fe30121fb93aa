use std::time::Duration;

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use dispatch_service::{
    error::DispatchError,
    models::status::{JobState, SubmitOutcome},
    ports::ScheduledJobStore,
};
use serde_json::json;
use tokio::sync::watch;
use tokio_test::assert_ok;

use crate::common::{FakeDirectory, Harness, HarnessBuilder, order_shipped_body, request, start_time};

fn three_user_harness() -> Harness {
    HarnessBuilder {
        directory: FakeDirectory::default()
            .with_phone_user("user-1", "01011111111")
            .with_phone_user("user-2", "01022222222")
            .with_phone_user("user-3", "01033333333"),
        ..Default::default()
    }
    .build()
}

fn scheduled_sms_body(offset: ChronoDuration) -> serde_json::Value {
    let mut body = order_shipped_body();
    body["recipients"] = json!({ "userIds": ["user-1", "user-2", "user-3"] });
    body["notificationTypes"] = json!(["SMS"]);
    body["scheduledAt"] = json!((start_time() + offset).to_rfc3339());
    body
}

/// Test: A job scheduled 60s ahead fires only once the clock reaches its time
#[tokio::test]
async fn test_scheduled_sms_fires_at_fire_time() -> Result<()> {
    let harness = three_user_harness();
    let body = request(scheduled_sms_body(ChronoDuration::seconds(60)));

    let outcome = harness.service.submit(Some("promo-001"), &body).await?;

    let fire_at = match outcome {
        SubmitOutcome::Scheduled { fire_at, .. } => fire_at,
        other => panic!("expected a scheduled outcome, got {:?}", other),
    };
    assert_eq!(fire_at, start_time() + ChronoDuration::seconds(60));
    assert_eq!(harness.scheduler.pending_count().await?, 1);

    harness.clock.advance(ChronoDuration::seconds(59));
    assert_eq!(harness.scheduler.tick().await?, 0, "Nothing is due at 59s");
    assert_eq!(harness.sms.count(), 0);
    assert_eq!(harness.service.status("promo-001").await?.state, JobState::Scheduled);

    harness.clock.advance(ChronoDuration::seconds(1));
    assert_eq!(harness.scheduler.tick().await?, 1);

    let view = harness.wait_for_report("promo-001").await;

    assert_eq!(view.state, JobState::Completed);
    assert_eq!(
        harness.sms.addresses(),
        vec!["01011111111", "01022222222", "01033333333"]
    );
    assert_eq!(harness.scheduler.pending_count().await?, 0);

    Ok(())
}

/// Test: A fired job is claimed once and never fires again
#[tokio::test]
async fn test_fired_job_does_not_fire_twice() -> Result<()> {
    let harness = three_user_harness();
    let body = request(scheduled_sms_body(ChronoDuration::seconds(5)));

    harness.service.submit(Some("promo-002"), &body).await?;
    harness.clock.advance(ChronoDuration::seconds(10));

    let (first, second) = tokio::join!(harness.scheduler.tick(), harness.scheduler.tick());
    assert_eq!(first? + second?, 1);

    harness.wait_for_report("promo-002").await;
    assert_eq!(harness.scheduler.tick().await?, 0);
    assert_eq!(harness.sms.count(), 3);

    Ok(())
}

/// Test: scheduledAt one second in the past is rejected, one second ahead is held
#[tokio::test]
async fn test_schedule_boundaries() -> Result<()> {
    let harness = three_user_harness();

    let past = harness
        .service
        .submit(
            Some("promo-003"),
            &request(scheduled_sms_body(ChronoDuration::seconds(-1))),
        )
        .await?;
    assert!(matches!(
        past,
        SubmitOutcome::Rejected { ref code, .. } if code == "validation_error"
    ));

    let now = harness
        .service
        .submit(
            Some("promo-004"),
            &request(scheduled_sms_body(ChronoDuration::zero())),
        )
        .await?;
    assert!(matches!(now, SubmitOutcome::Rejected { .. }), "scheduledAt must be strictly after now");

    let future = harness
        .service
        .submit(
            Some("promo-005"),
            &request(scheduled_sms_body(ChronoDuration::seconds(1))),
        )
        .await?;
    assert!(matches!(future, SubmitOutcome::Scheduled { .. }));

    assert_eq!(harness.scheduler.tick().await?, 0, "Not fired early");
    harness.clock.advance(ChronoDuration::seconds(1));
    assert_eq!(harness.scheduler.tick().await?, 1);

    Ok(())
}

/// Test: A cancelled job never dispatches and reports as cancelled
#[tokio::test]
async fn test_cancel_scheduled_job() -> Result<()> {
    let harness = three_user_harness();
    let body = request(scheduled_sms_body(ChronoDuration::seconds(60)));

    let outcome = harness.service.submit(Some("promo-006"), &body).await?;
    let job_id = outcome.job_id().expect("scheduled job id");

    let view = harness.service.cancel(job_id).await?;
    assert_eq!(view.state, JobState::Cancelled);
    assert_eq!(view.idempotency_key, "promo-006");

    harness.clock.advance(ChronoDuration::seconds(120));
    assert_eq!(harness.scheduler.tick().await?, 0);
    assert_eq!(harness.sms.count(), 0);

    let again = harness.service.cancel(job_id).await;
    assert!(matches!(again, Err(DispatchError::JobNotFound(_))));

    let replay = harness.service.submit(Some("promo-006"), &body).await?;
    assert_eq!(replay, outcome, "Cancellation does not change the recorded outcome");
    assert_eq!(
        harness.service.status("promo-006").await?.state,
        JobState::Cancelled
    );

    Ok(())
}

/// Test: A job that already fired can no longer be cancelled
#[tokio::test]
async fn test_cancel_after_fire_is_not_found() -> Result<()> {
    let harness = three_user_harness();
    let body = request(scheduled_sms_body(ChronoDuration::seconds(30)));

    let outcome = harness.service.submit(Some("promo-007"), &body).await?;
    harness.clock.advance(ChronoDuration::seconds(30));
    harness.scheduler.tick().await?;

    let result = harness
        .service
        .cancel(outcome.job_id().expect("job id"))
        .await;

    assert!(matches!(result, Err(DispatchError::JobNotFound(_))));

    Ok(())
}

/// Test: The scheduler loop picks up overdue jobs and stops on shutdown
#[tokio::test]
async fn test_run_loop_fires_and_stops() -> Result<()> {
    let harness = three_user_harness();
    let body = request(scheduled_sms_body(ChronoDuration::seconds(60)));

    harness.service.submit(Some("promo-008"), &body).await?;

    // Overdue by the time the loop starts, as after a restart.
    harness.clock.advance(ChronoDuration::minutes(5));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(harness.scheduler.clone().run(shutdown_rx));

    let view = harness.wait_for_report("promo-008").await;
    assert_eq!(view.state, JobState::Completed);
    assert_eq!(harness.sms.count(), 3);

    assert_ok!(shutdown_tx.send(true));
    tokio::time::timeout(Duration::from_secs(2), task).await??;

    assert_eq!(harness.scheduled.pending_count().await?, 0);

    Ok(())
}
