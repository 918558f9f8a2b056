//! Docs build: image resolution, the docs flag and generator output

use crate::helpers::*;
use docs_pipeline::core::{RunPhase, TriggerEvent};
use docs_pipeline::runner::ImageRef;
use docs_pipeline::stages::{DocsBuilder, LockState};
use docs_pipeline::{FailureKind, PipelineError};
use std::sync::Arc;

#[tokio::test]
async fn test_missing_image_fails_without_building_one() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(fx.config(), Some("1"));

    let report = dispatcher.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();

    assert!(!report.is_success());
    assert!(matches!(report.error, Some(PipelineError::StaleImage { .. })));
    assert_eq!(report.failure(), Some(FailureKind::Configuration));
    assert_eq!(
        report.phases,
        vec![RunPhase::Idle, RunPhase::Provisioning, RunPhase::Failed]
    );

    // Never falls back to building the image itself
    assert_eq!(fx.fetcher.calls(), 0);
    assert!(fx.runner.commands().is_empty());
    assert!(fx.target.deployed().is_empty());
    assert_eq!(fx.concurrency.len("pages"), 0);
}

#[tokio::test]
async fn test_stale_image_only_used_when_allowed() {
    let fx = Fixture::new();
    fx.build_image().await;
    fx.write_lock("[[package]]\nname = \"numpy\"\n");

    let strict = fx.dispatcher(fx.config(), None);
    let report = strict.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();
    match &report.error {
        Some(PipelineError::StaleImage { expected, .. }) => assert!(expected.starts_with("tradepy:lock-")),
        other => panic!("expected a stale image error, got {:?}", other),
    }

    let mut config = fx.config();
    config.docs.allow_stale_image = true;
    let lenient = fx.dispatcher(config, None);
    let report = lenient.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.image, Some(ImageRef::latest("tradepy")));
}

#[tokio::test]
async fn test_flag_off_installs_main_only() {
    let fx = Fixture::new();
    let built = fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("0"));

    let report = dispatcher.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.image, Some(built.image));
    assert_eq!(report.groups.map(|g| g.as_arg()), Some("main".to_string()));
    assert!(fx.runner.ran("'echo installing main'"));
    assert!(!fx.runner.ran("main,doc"));

    // The generator runs either way and sees the flag
    assert!(fx.live_page().contains("docs=0"));
}

#[tokio::test]
async fn test_flag_on_adds_doc_group() {
    let fx = Fixture::new();
    fx.build_image().await;
    let dispatcher = fx.dispatcher(fx.config(), Some("true"));

    let report = dispatcher.dispatch(TriggerEvent::manual()).await.unwrap().unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.groups.map(|g| g.as_arg()), Some("main,doc".to_string()));
    assert!(fx.runner.ran("'echo installing main,doc'"));
    assert!(fx.live_page().contains("docs=1"));
}

#[tokio::test]
async fn test_flag_default_applies_when_unset() {
    let fx = Fixture::new();
    fx.build_image().await;
    let mut config = fx.config();
    config.docs.flag.default = Some("yes".to_string());

    let report = fx
        .dispatcher(config, None)
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.groups.map(|g| g.as_arg()), Some("main,doc".to_string()));
}

#[tokio::test]
async fn test_empty_output_is_a_generator_failure() {
    let fx = Fixture::new();
    fx.build_image().await;
    let mut config = fx.config();
    config.docs.generator = "mkdir -p {{ output_dir }}".to_string();

    let report = fx
        .dispatcher(config, Some("1"))
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(report.error, Some(PipelineError::EmptyOutput(_))));
    assert_eq!(report.failure(), Some(FailureKind::Generator));
    assert_eq!(report.phase, RunPhase::Failed);
    assert!(!report.phases.contains(&RunPhase::BuildComplete));
    assert!(fx.target.deployed().is_empty());
}

#[tokio::test]
async fn test_generator_failure_skips_publish() {
    let fx = Fixture::new();
    fx.build_image().await;
    let mut config = fx.config();
    config.docs.generator = "echo 'mkdocs: config error' >&2; exit 3".to_string();

    let report = fx
        .dispatcher(config, Some("1"))
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    match &report.error {
        Some(PipelineError::Step { step, kind, .. }) => {
            assert_eq!(step, "generate");
            assert_eq!(*kind, FailureKind::Generator);
        }
        other => panic!("expected a generator failure, got {:?}", other),
    }
    assert_eq!(
        report.phases,
        vec![
            RunPhase::Idle,
            RunPhase::Provisioning,
            RunPhase::Building,
            RunPhase::Failed,
        ]
    );
    assert!(report.publish.is_none());
    assert_eq!(fx.target.configured(), 0);
    assert!(!fx.public().exists());
    assert_eq!(entries(&fx.artifacts()), 0);
    assert_eq!(fx.concurrency.len("pages"), 0);
}

#[tokio::test]
async fn test_workspace_is_clean_and_removed() {
    let fx = Fixture::new();
    fx.build_image().await;
    let mut config = fx.config();
    config.docs.generator = concat!(
        "test ! -e .git && test ! -e {{ output_dir }}/stale.html && test -f docs/index.md",
        " && mkdir -p {{ output_dir }} && echo ok > {{ output_dir }}/index.html"
    )
    .to_string();

    let report = fx
        .dispatcher(config, Some("1"))
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert!(fx.public().join("index.html").exists());
    assert!(!fx.public().join("stale.html").exists());
    assert_eq!(entries(&fx.workspaces()), 0);
    assert_eq!(entries(&fx.state().join("containers")), 0);
}

#[tokio::test]
async fn test_nested_output_dir_starts_empty() {
    let fx = Fixture::new();
    fx.build_image().await;
    let nested = fx.source().join("build/site");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("stale.html"), "left over from a local build\n").unwrap();
    std::fs::write(fx.source().join("build/notes.txt"), "kept\n").unwrap();

    let mut config = fx.config();
    config.docs.output_dir = "build/site".to_string();
    config.docs.generator = concat!(
        "test -f build/notes.txt && test ! -e {{ output_dir }}/stale.html",
        " && mkdir -p {{ output_dir }} && echo ok > {{ output_dir }}/index.html"
    )
    .to_string();

    let report = fx
        .dispatcher(config, Some("1"))
        .dispatch(TriggerEvent::manual())
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(fx.live_page().trim(), "ok");
    assert!(!fx.public().join("stale.html").exists());
}

fn docker_docs_builder(fx: &Fixture) -> DocsBuilder {
    DocsBuilder::new(Arc::new(fx.config()), fx.docker_runtime(), fx.engine())
}

#[tokio::test]
async fn test_unreachable_registry_is_a_fetch_failure() {
    let fx = Fixture::new();
    fx.runner.fail_on("image inspect", 1);
    fx.runner.fail_on("pull", 1);

    let lock = LockState::read(&fx.source().join("poetry.lock")).unwrap();
    let err = docker_docs_builder(&fx).resolve_image(&lock).await.unwrap_err();

    assert!(matches!(err, PipelineError::Pull { ref image, .. } if image.starts_with("tradepy:lock-")));
    assert_eq!(err.kind(), FailureKind::Fetch);
    assert!(fx.runner.ran("docker pull tradepy:lock-"));
}

#[tokio::test]
async fn test_image_missing_from_registry_is_stale() {
    let fx = Fixture::new();
    fx.runner.fail_on("image inspect", 1);
    fx.runner.fail_with(
        "pull",
        1,
        "Error response from daemon: manifest for tradepy not found: manifest unknown",
    );

    let lock = LockState::read(&fx.source().join("poetry.lock")).unwrap();
    let err = docker_docs_builder(&fx).resolve_image(&lock).await.unwrap_err();

    assert!(matches!(err, PipelineError::StaleImage { .. }));
    assert_eq!(err.kind(), FailureKind::Configuration);
}
