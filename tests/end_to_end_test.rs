mod common;

use common::{ScriptedFactory, SyntheticProvider, data_lines, pixel_catalog, test_config};
use std::collections::HashSet;
use std::fs;
use vifit::orchestrator::{Orchestrator, RunEvent, RunState};
use vifit::output::OutputWriter;

/// Full run over 1000 pixels where pixels 1..=100 never converge.
///
/// Checkpoint interval is 100 successes, so the 900 successes produce at least nine
/// saves before the merge. This test verifies:
/// - the output holds exactly the 900 succeeded keys, each once, in catalog order
/// - the 100 failures are listed with their reason
/// - summary.json agrees with the output (900 / 100 / 0 remaining)
/// - the checkpoint directory is gone after a completed run
#[test]
fn test_end_to_end_with_failing_prefix() {
    let test_dir = tempfile::tempdir().unwrap();
    let config = test_config(test_dir.path(), 100, 10);
    let catalog = pixel_catalog(1000);
    let factory = ScriptedFactory::failing(1..=100);

    let mut saves = Vec::new();
    let mut final_state = None;
    let summary = Orchestrator::new(config.clone(), &catalog, &SyntheticProvider, factory.clone())
        .with_observer(|event| match event {
            RunEvent::CheckpointSaved { saves: n, .. } => saves.push(*n),
            RunEvent::State(state) => final_state = Some(*state),
            _ => {}
        })
        .run()
        .unwrap();

    println!("[test] summary: {:?}", summary);
    assert_eq!(summary.succeeded, 900);
    assert_eq!(summary.failed, 100);
    assert_eq!(summary.remaining, 0);
    assert_eq!(summary.attempted_this_run, 1000);
    assert!(summary.completed);
    assert!(summary.checkpoint_saves >= 9, "expected at least 9 saves, got {}", summary.checkpoint_saves);
    assert_eq!(saves.len(), summary.checkpoint_saves);
    assert_eq!(final_state, Some(RunState::Done));
    assert_eq!(factory.attempts(), 1000);

    let rows = data_lines(&config.output);
    assert_eq!(rows.len(), 900);
    let ids: Vec<u32> = rows
        .iter()
        .map(|line| line.split(',').next().unwrap().parse().unwrap())
        .collect();
    assert_eq!(ids, (101..=1000).collect::<Vec<u32>>(), "rows must be unique and in catalog order");
    assert_eq!(rows[0], "101,0.101000,0.250000,180.500000,0.012500,23");

    let writer = OutputWriter::new(&config.output, config.phase);
    let failures = data_lines(&writer.failures_path());
    assert_eq!(failures.len(), 100);
    assert!(failures.iter().all(|line| line.ends_with(",non_convergence")));
    let failed_ids: HashSet<&str> = failures.iter().map(|l| l.split(',').next().unwrap()).collect();
    assert_eq!(failed_ids.len(), 100);

    let on_disk = writer.read_summary().unwrap().unwrap();
    assert_eq!(on_disk.succeeded, 900);
    assert_eq!(on_disk.failed, 100);
    assert_eq!(on_disk.remaining, 0);

    assert!(!config.checkpoint_dir().exists(), "checkpoint must be discarded after merge");
    assert!(fs::read_dir(config.output.parent().unwrap())
        .unwrap()
        .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp")));
}

/// The built-in harmonic fit driven through the real JSON-lines loader.
#[test]
fn test_end_to_end_with_harmonic_fit_from_jsonl() {
    use vifit::catalog::Catalog;
    use vifit::fit::HarmonicFactory;
    use vifit::series::SeriesTable;
    use vifit::work_unit::Phase;

    let test_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(test_dir.path(), 20, 4);
    config.phase = Phase::YearCurve;
    config.output = test_dir.path().join("output").join("year_curves.csv");

    let mut lines = String::new();
    for pixel_id in 1..=12u32 {
        for year in [2010u16, 2011] {
            // Pixel 12 has no 2011 data at all.
            if pixel_id == 12 && year == 2011 {
                continue;
            }
            for step in 0..23u16 {
                let doy = 1 + step * 16;
                let t = doy as f64;
                let value = 0.3 + 0.25 * (2.0 * std::f64::consts::PI * (t - 200.0) / 365.25).cos()
                    + 0.004 * ((step % 5) as f64 - 2.0);
                lines.push_str(&format!(
                    "{{\"pixel_id\":{},\"year\":{},\"doy\":{},\"value\":{}}}\n",
                    pixel_id, year, doy, value
                ));
            }
        }
    }
    fs::write(&config.input, lines).unwrap();

    let table = SeriesTable::load_jsonl(&config.input, config.windows).unwrap();
    let catalog = Catalog::from_series(Phase::YearCurve, &table, None).unwrap();
    assert_eq!(catalog.len(), 24);

    let summary = Orchestrator::new(config.clone(), &catalog, &table, HarmonicFactory)
        .run()
        .unwrap();

    assert_eq!(summary.succeeded + summary.failed, 24);
    assert_eq!(summary.remaining, 0);
    let failures = data_lines(&OutputWriter::new(&config.output, config.phase).failures_path());
    assert!(
        failures.contains(&"12,2011,insufficient_data".to_string()),
        "pixel-year without data must be a classified failure, got {:?}",
        failures
    );
    let header = fs::read_to_string(&config.output).unwrap();
    assert!(header.starts_with("pixel_id,year,intercept,amplitude,peak_doy,rmse,n_obs\n"));
}
