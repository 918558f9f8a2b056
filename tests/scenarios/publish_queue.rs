//! Publish queue: FIFO deploys, release on failure and job timeouts

use crate::helpers::*;
use docs_pipeline::core::{RunPhase, TriggerEvent};
use docs_pipeline::execution::{ConcurrencyBackend, ExecutionEvent};
use docs_pipeline::{FailureKind, PipelineError};
use std::time::Duration;
use uuid::Uuid;

const DEADLINE: Duration = Duration::from_secs(20);

/// Wait until `run_id` has built and is waiting for the publish group
async fn until_queued(fx: &Fixture, run_id: Uuid) {
    tokio::time::timeout(DEADLINE, async {
        loop {
            let queued = fx.events().iter().any(|event| {
                matches!(
                    event,
                    ExecutionEvent::PhaseChanged { run_id: id, phase: RunPhase::Queued } if *id == run_id
                )
            });
            if queued {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("run never reached the publish queue");
}

#[tokio::test]
async fn test_deploys_follow_trigger_order() {
    let fx = Fixture::with_deploy_delay(Duration::from_millis(50));
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let first = dispatcher
        .trigger(TriggerEvent::push("main").with_revision("r1"))
        .unwrap()
        .unwrap();
    let second = dispatcher
        .trigger(TriggerEvent::push("main").with_revision("r2"))
        .unwrap()
        .unwrap();
    let third = dispatcher
        .trigger(TriggerEvent::push("main").with_revision("r3"))
        .unwrap()
        .unwrap();
    assert_eq!(
        (first.position(), second.position(), third.position()),
        (0, 1, 2)
    );
    let expected = vec![first.run_id, second.run_id, third.run_id];

    // Started in reverse, deployed in trigger order
    let (c, b, a) = tokio::time::timeout(DEADLINE, async {
        tokio::join!(
            dispatcher.run(third),
            dispatcher.run(second),
            dispatcher.run(first)
        )
    })
    .await
    .expect("runs did not finish");

    for report in [&a, &b, &c] {
        assert!(report.is_success(), "{:?}", report.error);
        assert_eq!(report.phase, RunPhase::Deployed);
    }
    assert_eq!(fx.target.deployed(), expected);
    assert_eq!(fx.target.max_active(), 1);
    assert!(fx.live_page().contains("r3"));
    assert_eq!(fx.concurrency.len("pages"), 0);
}

#[tokio::test]
async fn test_failed_build_releases_its_place() {
    let fx = Fixture::new();
    fx.build_image().await;

    let mut broken = fx.config();
    broken.docs.generator = "exit 1".to_string();
    let failing = fx.dispatcher(broken, Some("1"));
    let working = fx.dispatcher(fx.config(), Some("1"));

    let ahead = failing.trigger(TriggerEvent::manual()).unwrap().unwrap();
    let behind = working
        .trigger(TriggerEvent::manual().with_revision("after-failure"))
        .unwrap()
        .unwrap();
    assert_eq!(behind.position(), 1);

    let (ok, failed) = tokio::time::timeout(DEADLINE, async {
        tokio::join!(working.run(behind), failing.run(ahead))
    })
    .await
    .expect("queue was not released");

    assert_eq!(failed.failure(), Some(FailureKind::Generator));
    assert!(ok.is_success(), "{:?}", ok.error);
    assert_eq!(fx.target.deployed(), vec![ok.run_id]);
    assert!(fx.live_page().contains("after-failure"));
}

#[tokio::test]
async fn test_deploy_failure_keeps_previous_site() {
    let fx = Fixture::new();
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let live = dispatcher
        .dispatch(TriggerEvent::manual().with_revision("good"))
        .await
        .unwrap()
        .unwrap();
    assert!(live.is_success(), "{:?}", live.error);

    fx.target.fail_deploys();
    let report = dispatcher
        .dispatch(TriggerEvent::manual().with_revision("bad"))
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        report.error,
        Some(PipelineError::Deploy {
            phase: RunPhase::Deploying,
            ..
        })
    ));
    assert_eq!(report.failure(), Some(FailureKind::Deployment));
    assert_eq!(
        &report.phases[report.phases.len() - 3..],
        &[RunPhase::ConfiguringTarget, RunPhase::Deploying, RunPhase::Failed]
    );
    assert!(fx.live_page().contains("good"));
    assert_eq!(fx.concurrency.len("pages"), 0);
}

#[tokio::test]
async fn test_queued_run_waits_for_earlier_ticket() {
    let fx = Fixture::new();
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let blocker = fx.concurrency.enqueue("pages", Uuid::new_v4()).unwrap();
    let queued = dispatcher.trigger(TriggerEvent::manual()).unwrap().unwrap();
    let run_id = queued.run_id;
    assert_eq!(queued.position(), 1);
    assert!(fx.events().iter().any(|event| matches!(
        event,
        ExecutionEvent::RunQueued { position: 1, .. }
    )));

    let release = async {
        until_queued(&fx, run_id).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.target.deployed().is_empty(), "deployed while another run held the group");
        drop(blocker);
    };
    let (report, ()) = tokio::join!(dispatcher.run(queued), release);

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(fx.target.deployed(), vec![run_id]);
}

#[tokio::test]
async fn test_time_in_queue_does_not_count_against_job_timeout() {
    let fx = Fixture::new();
    fx.build_image().await;
    let timeout = Duration::from_secs(2);
    let dispatcher = fx
        .dispatcher(fx.config(), Some("1"))
        .with_job_timeout(timeout);

    let blocker = fx.concurrency.enqueue("pages", Uuid::new_v4()).unwrap();
    let queued = dispatcher.trigger(TriggerEvent::manual()).unwrap().unwrap();
    let run_id = queued.run_id;

    let release = async {
        until_queued(&fx, run_id).await;
        tokio::time::sleep(timeout + Duration::from_millis(500)).await;
        drop(blocker);
    };
    let (report, ()) = tokio::join!(dispatcher.run(queued), release);

    assert!(report.is_success(), "{:?}", report.error);
}

#[tokio::test]
async fn test_hung_generator_times_out() {
    let fx = Fixture::new();
    fx.build_image().await;
    let mut config = fx.config();
    config.docs.generator = "sleep 5".to_string();
    let dispatcher = fx
        .dispatcher(config, Some("1"))
        .with_job_timeout(Duration::from_millis(300));

    let started = std::time::Instant::now();
    let report = dispatcher.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    match &report.error {
        Some(PipelineError::Timeout { job, .. }) => assert_eq!(job, "docs"),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(report.failure(), Some(FailureKind::Timeout));
    assert_eq!(report.phase, RunPhase::Failed);
    assert!(fx.target.deployed().is_empty());
    assert_eq!(fx.concurrency.len("pages"), 0);
}
