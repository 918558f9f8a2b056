//! Full runs: image, docs and publish together, plus run history

use crate::helpers::*;
use docs_pipeline::core::{ExecutionStatus, RunPhase, TriggerEvent};
use docs_pipeline::digest::hash_file;
use docs_pipeline::execution::ExecutionEvent;
use docs_pipeline::persistence::{PersistenceBackend, Workflow};
use docs_pipeline::stages::target::CommandTarget;
use std::sync::Arc;

#[tokio::test]
async fn test_push_to_main_publishes_site() {
    let fx = Fixture::new();
    let image = fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let report = dispatcher
        .dispatch(TriggerEvent::push("main").with_revision("4f6c2a9d1e"))
        .await
        .unwrap()
        .expect("push to main is accepted");

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.trigger, "push to main @ 4f6c2a9");
    assert_eq!(
        report.phases,
        vec![
            RunPhase::Idle,
            RunPhase::Provisioning,
            RunPhase::Building,
            RunPhase::BuildComplete,
            RunPhase::Queued,
            RunPhase::Uploading,
            RunPhase::ConfiguringTarget,
            RunPhase::Deploying,
            RunPhase::Deployed,
        ]
    );
    assert_eq!(report.image, Some(image.image.clone()));

    let publish = report.publish.as_ref().expect("publish report");
    assert_eq!(publish.artifact.digest.to_string(), publish.receipt.digest);
    assert_eq!(hash_file(&publish.artifact.path).unwrap(), publish.artifact.digest);
    assert_eq!(publish.receipt.location, path_str(&fx.public()));
    assert!(fx.live_page().contains("4f6c2a9d1e docs=1"));
    assert_eq!(fx.target.configured(), 1);

    let deployed: Vec<String> = fx
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ExecutionEvent::Deployed { run_id, digest, .. } if run_id == report.run_id => Some(digest),
            _ => None,
        })
        .collect();
    assert_eq!(deployed, vec![publish.receipt.digest.clone()]);

    let summary = fx
        .history
        .load_run(report.run_id)
        .await
        .unwrap()
        .expect("run recorded");
    assert_eq!(summary.workflow, Workflow::Docs);
    assert_eq!(summary.status, ExecutionStatus::Completed);
    assert_eq!(summary.phase, Some(RunPhase::Deployed));
    assert_eq!(summary.image, Some(image.image.to_string()));
    assert_eq!(summary.artifact_digest, Some(publish.receipt.digest.clone()));
    assert!(summary.completed_at.is_some());
    assert!(summary.failure.is_none());
}

#[tokio::test]
async fn test_push_to_other_branch_is_ignored() {
    let fx = Fixture::new();
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let outcome = dispatcher
        .dispatch(TriggerEvent::push("feature/faster-docs"))
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert_eq!(fx.concurrency.len("pages"), 0);
    assert!(fx.events().is_empty());
    assert!(fx
        .history
        .list_runs(None, Some(Workflow::Docs), 10)
        .await
        .unwrap()
        .is_empty());

    let release = dispatcher
        .dispatch(TriggerEvent::push("release/1.4"))
        .await
        .unwrap()
        .expect("release branches are accepted");
    assert!(release.is_success(), "{:?}", release.error);
}

#[tokio::test]
async fn test_history_records_both_workflows() {
    let fx = Fixture::new();
    fx.build_image().await;

    let mut broken = fx.config();
    broken.docs.generator = "exit 4".to_string();
    let failed = fx
        .dispatcher(broken, Some("1"))
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    let images = fx
        .history
        .list_runs(Some("tradepy-docs"), Some(Workflow::Image), 10)
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].status, ExecutionStatus::Completed);
    assert!(images[0].image.as_deref().is_some_and(|i| i.starts_with("tradepy:lock-")));

    let docs = fx
        .history
        .list_runs(Some("tradepy-docs"), Some(Workflow::Docs), 10)
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].run_id, failed.run_id);
    assert_eq!(docs[0].status, ExecutionStatus::Failed);
    assert_eq!(docs[0].phase, Some(RunPhase::Failed));
    assert!(docs[0].error.as_deref().is_some_and(|e| e.contains("generate")));

    assert_eq!(
        fx.history.list_pipelines().await.unwrap(),
        vec!["tradepy-docs".to_string()]
    );
}

#[tokio::test]
async fn test_command_target_reports_location_from_output() {
    let fx = Fixture::new();
    fx.build_image().await;
    let uploads = fx.dir.path().join("uploads");
    std::fs::create_dir_all(&uploads).unwrap();

    let target = Arc::new(CommandTarget::new(
        Some(format!("touch {}/configured", path_str(&uploads))),
        format!(
            "cp \"$ARTIFACT_PATH\" {}/site.tar.gz && echo https://docs.example.com/$RUN_ID",
            path_str(&uploads)
        ),
        fx.runner.clone(),
    ));
    let dispatcher = fx.dispatcher_with_target(fx.config(), Some("1"), target);

    let report = dispatcher
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    let publish = report.publish.expect("publish report");
    assert_eq!(
        publish.receipt.location,
        format!("https://docs.example.com/{}", report.run_id)
    );
    assert!(uploads.join("configured").exists());
    assert_eq!(
        hash_file(&uploads.join("site.tar.gz")).unwrap().to_string(),
        publish.receipt.digest
    );
}

#[tokio::test]
async fn test_only_the_live_artifact_is_kept() {
    let fx = Fixture::new();
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let mut last = None;
    for revision in ["r1", "r2", "r3"] {
        let report = dispatcher
            .dispatch(TriggerEvent::manual().with_revision(revision))
            .await
            .unwrap()
            .unwrap();
        assert!(report.is_success(), "{:?}", report.error);
        last = Some(report);
    }

    let last = last.unwrap();
    assert_eq!(entries(&fx.artifacts()), 1);
    assert!(fx.artifacts().join(last.run_id.to_string()).is_dir());
    assert!(fx.live_page().contains("r3"));
}
