//! Image build: tagging, native archive verification and fail-fast

use crate::helpers::*;
use docs_pipeline::digest::hash_file;
use docs_pipeline::execution::{ExecutionEvent, Stage, StepError};
use docs_pipeline::runner::ImageRef;
use docs_pipeline::stages::image::{LOCK_DIGEST_LABEL, NATIVE_LABEL};
use docs_pipeline::stages::native::FetchError;
use docs_pipeline::{FailureKind, PipelineError};
use uuid::Uuid;

fn position(commands: &[String], pattern: &str) -> usize {
    commands
        .iter()
        .position(|c| c.contains(pattern))
        .unwrap_or_else(|| panic!("no command containing `{}` in {:#?}", pattern, commands))
}

#[tokio::test]
async fn test_build_tags_image_by_lock_digest() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(fx.config(), None);

    let report = dispatcher.build_image(Uuid::new_v4()).await.unwrap();

    let lock = hash_file(&fx.source().join("poetry.lock")).unwrap();
    assert_eq!(report.image, ImageRef::for_lock("tradepy", &lock));
    assert_eq!(report.image.tag, format!("lock-{}", lock.short(12)));
    assert_eq!(report.tags, vec![report.image.clone(), ImageRef::latest("tradepy")]);
    assert_eq!(report.lock.digest, lock);

    let runtime = fx.runtime();
    for tag in &report.tags {
        let record = runtime.image_record(tag).unwrap().expect("image record");
        assert_eq!(record.workdir, "/app");
        assert_eq!(record.labels.get(LOCK_DIGEST_LABEL), Some(&lock.to_string()));
        assert_eq!(record.labels.get(NATIVE_LABEL), Some(&"ta-lib-0.4.0".to_string()));
    }

    let tagged: Vec<ImageRef> = fx
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ExecutionEvent::ImageTagged { image, .. } => Some(image),
            _ => None,
        })
        .collect();
    assert_eq!(tagged, report.tags);
}

#[tokio::test]
async fn test_build_runs_native_then_resolver_with_main_only() {
    let fx = Fixture::new();
    fx.dispatcher(fx.config(), Some("1"))
        .build_image(Uuid::new_v4())
        .await
        .unwrap();

    let commands = fx.runner.commands();
    let extract = position(&commands, "tar -xzf");
    let configure = position(&commands, "sh ./configure");
    let compile = position(&commands, "echo compiled");
    let install = position(&commands, "cp built.txt");
    let resolver = position(&commands, "echo poetry");
    let dependencies = position(&commands, "echo installing");
    assert!(extract < configure && configure < compile && compile < install);
    assert!(install < resolver && resolver < dependencies);

    // The docs flag never reaches the image build
    assert!(commands[dependencies].contains("'echo installing main'"));
    assert!(!fx.runner.ran("main,doc"));
}

#[tokio::test]
async fn test_fetch_failure_aborts_before_resolver() {
    let fx = Fixture::new();
    fx.fetcher.respond_with_status(404);
    let dispatcher = fx.dispatcher(fx.config(), None);

    let err = dispatcher.build_image(Uuid::new_v4()).await.unwrap_err();

    match &err {
        PipelineError::Step { step, source, .. } => {
            assert_eq!(step, "fetch-native");
            assert!(matches!(source, StepError::Fetch(FetchError::Status { status: 404, .. })));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(err.kind(), FailureKind::Fetch);

    assert!(!fx.runner.ran("echo poetry"));
    assert!(!fx.runner.ran("echo installing"));
    assert!(!fx.runtime().image_exists(&ImageRef::latest("tradepy")).await.unwrap());

    let skipped = fx.skipped_steps();
    assert_eq!(skipped.first().map(String::as_str), Some("stage-native"));
    assert!(skipped.contains(&"install-dependencies".to_string()));
    assert_eq!(skipped.last().map(String::as_str), Some("commit-image"));
}

#[tokio::test]
async fn test_checksum_mismatch_never_reaches_the_build() {
    let fx = Fixture::new();
    fx.fetcher.serve(b"not the release you are looking for".to_vec());
    let dispatcher = fx.dispatcher(fx.config(), None);

    let err = dispatcher.build_image(Uuid::new_v4()).await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Step {
            source: StepError::Fetch(FetchError::HashMismatch { .. }),
            ..
        }
    ));
    assert_eq!(err.kind(), FailureKind::Fetch);
    assert!(!fx.runner.ran("tar -xzf"));
    assert!(!fx
        .dir
        .path()
        .join("downloads")
        .join("ta-lib-0.4.0-src.tar.gz")
        .exists());
}

#[tokio::test]
async fn test_same_lock_rebuilds_to_same_tag_and_reuses_download() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(fx.config(), None);

    let first = dispatcher.build_image(Uuid::new_v4()).await.unwrap();
    let installs_first: Vec<String> = fx
        .runner
        .commands()
        .into_iter()
        .filter(|c| c.contains("echo installing"))
        .collect();
    fx.runner.clear();

    let second = dispatcher.build_image(Uuid::new_v4()).await.unwrap();
    let installs_second: Vec<String> = fx
        .runner
        .commands()
        .into_iter()
        .filter(|c| c.contains("echo installing"))
        .collect();

    assert_eq!(first.image, second.image);
    assert_eq!(installs_first, installs_second);
    assert_eq!(fx.fetcher.calls(), 1);
}

#[tokio::test]
async fn test_lock_change_produces_new_tag() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(fx.config(), None);
    let before = dispatcher.build_image(Uuid::new_v4()).await.unwrap();

    fx.write_lock("[[package]]\nname = \"pandas\"\nversion = \"2.2.2\"\n");
    let after = dispatcher.build_image(Uuid::new_v4()).await.unwrap();

    assert_ne!(before.image, after.image);
    let runtime = fx.runtime();
    assert!(runtime.image_exists(&before.image).await.unwrap());

    let latest = runtime
        .image_record(&ImageRef::latest("tradepy"))
        .unwrap()
        .expect("latest record");
    assert_eq!(
        latest.labels.get(LOCK_DIGEST_LABEL),
        Some(&after.lock.digest.to_string())
    );
}

#[tokio::test]
async fn test_compile_failure_commits_nothing() {
    let fx = Fixture::new();
    fx.runner.fail_on("echo compiled", 2);
    let dispatcher = fx.dispatcher(fx.config(), None);

    let err = dispatcher.build_image(Uuid::new_v4()).await.unwrap_err();

    match &err {
        PipelineError::Step { step, kind, .. } => {
            assert_eq!(step, "compile-native");
            assert_eq!(*kind, FailureKind::Build);
        }
        other => panic!("unexpected error: {}", other),
    }

    let lock = hash_file(&fx.source().join("poetry.lock")).unwrap();
    let runtime = fx.runtime();
    assert!(!runtime.image_exists(&ImageRef::for_lock("tradepy", &lock)).await.unwrap());
    assert!(!runtime.image_exists(&ImageRef::latest("tradepy")).await.unwrap());
    assert!(!fx.runner.ran("cp built.txt"));
    assert_eq!(
        fx.skipped_steps(),
        vec![
            "install-native",
            "cleanup-native",
            "install-resolver",
            "install-dependencies",
            "commit-image",
        ]
    );

    // Build containers do not outlive the build
    assert_eq!(entries(&fx.state().join("containers")), 0);
}

#[tokio::test]
async fn test_missing_lock_file_fails_before_fetching() {
    let fx = Fixture::new();
    std::fs::remove_file(fx.source().join("poetry.lock")).unwrap();
    let dispatcher = fx.dispatcher(fx.config(), None);

    let err = dispatcher.build_image(Uuid::new_v4()).await.unwrap_err();

    assert!(matches!(err, PipelineError::MissingLockFile(_)));
    assert_eq!(err.kind(), FailureKind::Build);
    assert_eq!(fx.fetcher.calls(), 0);
    assert!(fx.runner.commands().is_empty());
}

#[tokio::test]
async fn test_concurrent_builds_are_serialized() {
    let fx = Fixture::new();
    let dispatcher = fx.dispatcher(fx.config(), None);

    let (a, b) = tokio::join!(
        dispatcher.build_image(Uuid::new_v4()),
        dispatcher.build_image(Uuid::new_v4())
    );
    assert_eq!(a.unwrap().image, b.unwrap().image);

    let mut open: Option<Uuid> = None;
    let mut stages = 0;
    for event in fx.events() {
        match event {
            ExecutionEvent::StageStarted {
                run_id,
                stage: Stage::Image,
                ..
            } => {
                assert!(open.is_none(), "image stages overlapped");
                open = Some(run_id);
                stages += 1;
            }
            ExecutionEvent::StageCompleted {
                run_id,
                stage: Stage::Image,
                ..
            } => {
                assert_eq!(open.take(), Some(run_id));
            }
            _ => {}
        }
    }
    assert_eq!(stages, 2);
}
