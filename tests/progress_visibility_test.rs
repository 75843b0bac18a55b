mod common;

use common::{ScriptedFactory, SyntheticProvider, pixel_catalog, test_config};
use vifit::orchestrator::{Orchestrator, RunEvent};
use vifit::progress::ProgressLine;

/// The first 500 attempts all fail. Progress lines are keyed on attempts, so the
/// operator still sees ten reports during that stretch, and the rate reflects the
/// failures rather than sitting at zero.
#[test]
fn test_reports_emitted_while_everything_fails() {
    let test_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(test_dir.path(), 100, 10);
    config.report_every = 50;
    let catalog = pixel_catalog(1000);

    let mut lines: Vec<ProgressLine> = Vec::new();
    let mut saves = 0;
    Orchestrator::new(config, &catalog, &SyntheticProvider, ScriptedFactory::failing(1..=500))
        .with_observer(|event| match event {
            RunEvent::Progress(line) => lines.push(line.clone()),
            RunEvent::CheckpointSaved { .. } => saves += 1,
            _ => {}
        })
        .run()
        .unwrap();

    let during_failures: Vec<&ProgressLine> = lines.iter().filter(|l| l.succeeded_this_run == 0).collect();
    assert_eq!(during_failures.len(), 10);
    for (i, line) in during_failures.iter().enumerate() {
        assert_eq!(line.failed_this_run, 50 * (i as u64 + 1));
        assert_eq!(line.remaining, 1000 - line.failed_this_run);
        assert!(line.rate_per_sec > 0.0, "failures count toward the rate");
    }

    assert_eq!(lines.len(), 20);
    assert_eq!(saves, 5);
    let last = lines.last().unwrap();
    assert_eq!(last.succeeded_this_run, 500);
    assert_eq!(last.failed_this_run, 500);
    assert_eq!(last.remaining, 0);
}
