//! End-to-end pipeline behavior over a wired stack with a pinned clock.

mod common;

use calimg::history::Trigger;
use calimg::naming::ConfigId;
use calimg::pipeline::RunOptions;

use common::{TestEnv, on_demand_config, sample_event, scheduled_config};

fn save(trigger: Trigger) -> RunOptions {
    RunOptions {
        trigger,
        save_cache: true,
    }
}

#[tokio::test]
async fn run_produces_png_and_caches_it() {
    let env = TestEnv::new(&[("a.json", scheduled_config())], vec![sample_event()]).await;
    let id = ConfigId::new("a").unwrap();

    let output = env.pipeline.run(&id, save(Trigger::Boot)).await.unwrap();
    assert_eq!(output.content_type, "image/png");
    assert_eq!(&output.bytes[..8], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]);
    assert_eq!(output.crc32, calimg::checksum::crc32_hex(&output.bytes));
    assert_eq!(output.event_count, 1);
    assert!(output.changed, "first run has no predecessor");

    let cached = env.cache.read(&id).await.unwrap();
    assert_eq!(*cached.bytes, output.bytes);
    assert_eq!(cached.metadata.crc32, output.crc32);
}

#[tokio::test]
async fn identical_inputs_yield_identical_crc() {
    let env = TestEnv::new(&[("a.json", scheduled_config())], vec![sample_event()]).await;
    let id = ConfigId::new("a").unwrap();

    let first = env.pipeline.run(&id, save(Trigger::Fresh)).await.unwrap();
    let second = env.pipeline.run(&id, save(Trigger::Fresh)).await.unwrap();
    assert_eq!(first.crc32, second.crc32);
    assert_eq!(first.bytes, second.bytes);
    // The second run saw the first's cached checksum.
    assert!(!second.changed);
}

#[tokio::test]
async fn run_without_save_leaves_cache_empty() {
    let env = TestEnv::new(&[("a.json", on_demand_config())], vec![]).await;
    let id = ConfigId::new("a").unwrap();

    let output = env
        .pipeline
        .run(
            &id,
            RunOptions {
                trigger: Trigger::OnDemand,
                save_cache: false,
            },
        )
        .await
        .unwrap();
    assert!(output.metadata.is_none());
    assert!(env.cache.read(&id).await.is_none());
    assert!(env.ledger.load(&id, None).await.is_empty());
}

#[tokio::test]
async fn missing_config_maps_to_config_not_found() {
    let env = TestEnv::new(&[], vec![]).await;
    let id = ConfigId::new("zz").unwrap();
    let err = env.pipeline.run(&id, save(Trigger::OnDemand)).await.unwrap_err();
    assert_eq!(err.kind(), "ConfigNotFound");
}

#[tokio::test]
async fn invalid_config_maps_to_config_invalid() {
    let env = TestEnv::new(&[("bad.json", r#"{"template":"week-view","rotate":45}"#)], vec![]).await;
    let id = ConfigId::new("bad").unwrap();
    let err = env.pipeline.run(&id, save(Trigger::OnDemand)).await.unwrap_err();
    assert_eq!(err.kind(), "ConfigInvalid");
}

#[tokio::test]
async fn missing_template_maps_to_template_failed() {
    let env = TestEnv::new(
        &[("a.json", r#"{"template":"no-such-template"}"#)],
        vec![],
    )
    .await;
    let id = ConfigId::new("a").unwrap();
    let err = env.pipeline.run(&id, save(Trigger::OnDemand)).await.unwrap_err();
    assert_eq!(err.kind(), "TemplateFailed");
}

#[tokio::test]
async fn trigger_reaches_the_ledger() {
    let env = TestEnv::new(&[("a.json", scheduled_config())], vec![]).await;
    let id = ConfigId::new("a").unwrap();
    env.pipeline.run(&id, save(Trigger::Crc32Check)).await.unwrap();

    let mut entries = Vec::new();
    for _ in 0..50 {
        entries = env.ledger.load(&id, None).await;
        if !entries.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].trigger, Trigger::Crc32Check);
    assert!(entries[0].generation_duration.is_some());
}

#[tokio::test]
async fn grayscale_and_rotation_change_the_artifact() {
    let env = TestEnv::new(
        &[
            ("plain.json", on_demand_config()),
            (
                "rotated.json",
                r#"{"template":"week-view","width":400,"height":300,"rotate":90}"#,
            ),
            (
                "gray.json",
                r#"{"template":"week-view","width":400,"height":300,"grayscale":true}"#,
            ),
        ],
        vec![sample_event()],
    )
    .await;

    let plain = env
        .pipeline
        .run(&ConfigId::new("plain").unwrap(), save(Trigger::OnDemand))
        .await
        .unwrap();
    let rotated = env
        .pipeline
        .run(&ConfigId::new("rotated").unwrap(), save(Trigger::OnDemand))
        .await
        .unwrap();
    let gray = env
        .pipeline
        .run(&ConfigId::new("gray").unwrap(), save(Trigger::OnDemand))
        .await
        .unwrap();

    assert_ne!(plain.crc32, rotated.crc32);
    assert_ne!(plain.crc32, gray.crc32);

    let decoded = image::load_from_memory(&rotated.bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (300, 400));
}
