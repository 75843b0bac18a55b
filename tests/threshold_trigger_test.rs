mod common;

use common::{ScriptedFactory, SyntheticProvider, pixel_catalog, test_config};
use vifit::orchestrator::{Orchestrator, RunEvent};

/// Interval 500 with 8-unit batches: successes step 496 -> 504, so an exact-multiple
/// check would never save. The crossing check saves at 504 and then at least every
/// 508 successes.
#[test]
fn test_saves_fire_on_threshold_crossing() {
    let test_dir = tempfile::tempdir().unwrap();
    let config = test_config(test_dir.path(), 500, 8);
    let catalog = pixel_catalog(3000);

    let mut marks = Vec::new();
    let summary = Orchestrator::new(config, &catalog, &SyntheticProvider, ScriptedFactory::succeeding())
        .with_observer(|event| {
            if let RunEvent::CheckpointSaved { processed_this_run, .. } = event {
                marks.push(*processed_this_run);
            }
        })
        .run()
        .unwrap();

    println!("[test] saves at {:?}", marks);
    assert_eq!(marks.first(), Some(&504));
    assert!(marks.iter().all(|m| m % 500 != 0), "an exact-multiple check would have missed all of these");

    let mut previous = 0;
    for mark in &marks {
        let gap = mark - previous;
        assert!((500..=508).contains(&gap), "gap {} outside 500..=508", gap);
        previous = *mark;
    }
    assert_eq!(marks.len(), 5);
    assert_eq!(summary.checkpoint_saves, 5);
}

/// Failures never move the save threshold; only successes do.
#[test]
fn test_failures_do_not_trigger_saves() {
    let test_dir = tempfile::tempdir().unwrap();
    let config = test_config(test_dir.path(), 100, 10);
    let catalog = pixel_catalog(400);

    let mut saves = 0;
    Orchestrator::new(config, &catalog, &SyntheticProvider, ScriptedFactory::failing(1..=350))
        .with_observer(|event| {
            if let RunEvent::CheckpointSaved { .. } = event {
                saves += 1;
            }
        })
        .run()
        .unwrap();

    assert_eq!(saves, 0, "50 successes never reach an interval of 100");
}
