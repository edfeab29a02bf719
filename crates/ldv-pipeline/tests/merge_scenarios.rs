//! End-to-end merge runs against temp directories: first version, no-op
//! reruns, dedup against live and backed-up versions, failure safety.

use std::fs;
use std::path::Path;

use ldv_core::ColumnSchema;
use ldv_pipeline::{FileStatus, MergeConfig, MergeOutcome, MergePipeline};
use tempfile::tempdir;

fn test_config(root: &Path) -> MergeConfig {
    let mut config = MergeConfig::new(root.join("input"), root.join("output"));
    config.schema = ColumnSchema::new(vec!["name".into(), "email".into()]);
    config
}

fn write_input(config: &MergeConfig, name: &str, body: &[u8]) {
    fs::create_dir_all(&config.input_dir).expect("create input dir");
    fs::write(config.input_dir.join(name), body).expect("write input file");
}

fn dir_file_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok()).count())
        .unwrap_or(0)
}

const THREE_ROWS: &[u8] = b"name,email\nAda,a@x.com\nBob,b@x.com\nCleo,c@x.com\n";

#[test]
fn first_run_writes_one_version_and_consumes_input() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "drop.csv", THREE_ROWS);

    let summary = MergePipeline::new(config.clone()).run_once().expect("run");
    let MergeOutcome::Written { version, backup } = &summary.outcome else {
        panic!("expected Written outcome, got {:?}", summary.outcome);
    };
    assert!(backup.is_none());
    assert_eq!(summary.total_rows, 3);
    assert!(!config.input_dir.join("drop.csv").exists());
    assert_eq!(dir_file_count(&config.output_dir), 1);

    let text = fs::read_to_string(version).expect("read version");
    assert_eq!(
        text,
        "name,email,source\nAda,a@x.com,drop.csv\nBob,b@x.com,drop.csv\nCleo,c@x.com,drop.csv\n"
    );
}

#[test]
fn rerun_with_consumed_input_is_a_noop() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "drop.csv", THREE_ROWS);

    let pipeline = MergePipeline::new(config.clone());
    pipeline.run_once().expect("first run");
    let second = pipeline.run_once().expect("second run");

    assert!(matches!(second.outcome, MergeOutcome::NoInput));
    assert_eq!(second.total_rows, 0);
    assert_eq!(dir_file_count(&config.output_dir), 1);
}

#[test]
fn identical_redrop_reports_existing_version_and_writes_nothing() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "drop.csv", THREE_ROWS);
    let first = pipeline.run_once().expect("first run");
    let MergeOutcome::Written { version: first_version, .. } = first.outcome else {
        panic!("expected Written outcome");
    };

    // same rows under the same file name arrive again
    write_input(&config, "drop.csv", THREE_ROWS);
    let second = pipeline.run_once().expect("second run");
    let MergeOutcome::Unchanged { version } = &second.outcome else {
        panic!("expected Unchanged outcome, got {:?}", second.outcome);
    };
    assert_eq!(version, &first_version);
    assert!(!config.input_dir.join("drop.csv").exists());
    assert_eq!(dir_file_count(&config.output_dir), 1);
}

#[test]
fn relabeled_rows_register_as_a_new_version() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "drop.csv", THREE_ROWS);
    pipeline.run_once().expect("first run");

    // identical rows, different originating file name: the source column
    // participates in the dataset identity
    write_input(&config, "renamed.csv", THREE_ROWS);
    let second = pipeline.run_once().expect("second run");
    assert!(matches!(second.outcome, MergeOutcome::Written { .. }));
}

#[test]
fn rotation_skips_backup_copy_when_content_already_archived() {
    let root = tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.backup_dir = Some(root.path().join("backup"));
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "drop.csv", THREE_ROWS);
    let first = pipeline.run_once().expect("first run");
    let MergeOutcome::Written { backup, .. } = &first.outcome else {
        panic!("expected Written outcome");
    };
    assert!(backup.is_some());
    let backup_dir = config.backup_dir.clone().expect("backup dir");
    assert_eq!(dir_file_count(&backup_dir), 1);

    // differing content arrives; the live version rotates out, but its
    // bytes are already in backup, so it is deleted rather than copied
    write_input(&config, "drop.csv", b"name,email\nDee,d@x.com\n");
    let second = pipeline.run_once().expect("second run");
    let MergeOutcome::Written { version, backup } = &second.outcome else {
        panic!("expected Written outcome, got {:?}", second.outcome);
    };
    assert!(backup.is_some());
    assert_eq!(dir_file_count(&config.output_dir), 1);
    assert_eq!(dir_file_count(&backup_dir), 2);
    let text = fs::read_to_string(version).expect("read version");
    assert!(text.contains("Dee,d@x.com,drop.csv"));
}

#[test]
fn comparison_falls_back_to_backup_when_live_dir_is_empty() {
    let root = tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.backup_dir = Some(root.path().join("backup"));
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "drop.csv", THREE_ROWS);
    let first = pipeline.run_once().expect("first run");
    let MergeOutcome::Written { version, .. } = first.outcome else {
        panic!("expected Written outcome");
    };

    // live artifact lost (e.g. manually cleared); backup still holds it
    fs::remove_file(&version).expect("remove live version");
    write_input(&config, "drop.csv", THREE_ROWS);
    let second = pipeline.run_once().expect("second run");
    let MergeOutcome::Unchanged { version } = &second.outcome else {
        panic!("expected Unchanged outcome, got {:?}", second.outcome);
    };
    assert!(version.starts_with(config.backup_dir.as_ref().expect("backup dir")));
    assert_eq!(dir_file_count(&config.output_dir), 0);
}

#[test]
fn overwrite_flag_forces_a_new_version_on_identical_content() {
    let root = tempdir().expect("tempdir");
    let mut config = test_config(root.path());
    config.overwrite_existing = true;
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "drop.csv", THREE_ROWS);
    pipeline.run_once().expect("first run");
    write_input(&config, "drop.csv", THREE_ROWS);
    let second = pipeline.run_once().expect("second run");

    assert!(matches!(second.outcome, MergeOutcome::Written { .. }));
    // the previous version was rotated (deleted: no backup configured)
    assert_eq!(dir_file_count(&config.output_dir), 1);
}

#[test]
fn latin1_input_is_merged_and_tagged_with_its_source() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "latin.csv", b"name,email\nJos\xe9,j@x.com\n");

    let summary = MergePipeline::new(config.clone()).run_once().expect("run");
    let MergeOutcome::Written { version, .. } = &summary.outcome else {
        panic!("expected Written outcome");
    };
    let text = fs::read_to_string(version).expect("read version");
    assert!(text.contains("Jos\u{e9},j@x.com,latin.csv"));
}

#[test]
fn empty_and_missing_row_files_are_skipped_but_not_consumed() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "good.csv", THREE_ROWS);
    write_input(&config, "empty.csv", b"");
    write_input(&config, "header-only.csv", b"name,email\n");

    let summary = MergePipeline::new(config.clone()).run_once().expect("run");
    assert!(matches!(summary.outcome, MergeOutcome::Written { .. }));
    assert_eq!(summary.total_rows, 3);

    let merged = summary
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Merged { .. }))
        .count();
    let skipped = summary
        .files
        .iter()
        .filter(|f| matches!(f.status, FileStatus::Skipped { .. }))
        .count();
    assert_eq!((merged, skipped), (1, 2));

    // skipped files stay on disk for a later retry; the merged one is gone
    assert!(!config.input_dir.join("good.csv").exists());
    assert!(config.input_dir.join("empty.csv").exists());
    assert!(config.input_dir.join("header-only.csv").exists());
}

#[test]
fn all_inputs_skipped_ends_with_no_side_effects() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "empty.csv", b"");

    let summary = MergePipeline::new(config.clone()).run_once().expect("run");
    assert!(matches!(summary.outcome, MergeOutcome::NoInput));
    assert!(config.input_dir.join("empty.csv").exists());
    assert_eq!(dir_file_count(&config.output_dir), 0);
}

#[test]
fn failed_run_leaves_inputs_intact() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    write_input(&config, "drop.csv", THREE_ROWS);
    // output location is unusable: a file sits where the directory must go
    fs::write(root.path().join("output"), b"in the way").expect("block output dir");

    let result = MergePipeline::new(config.clone()).run_once();
    assert!(result.is_err());
    assert!(config.input_dir.join("drop.csv").exists());
}

#[test]
fn multi_file_redrop_with_unchanged_rows_is_deduplicated() {
    let root = tempdir().expect("tempdir");
    let config = test_config(root.path());
    let pipeline = MergePipeline::new(config.clone());

    write_input(&config, "a.csv", b"name,email\nAda,a@x.com\n");
    write_input(&config, "b.csv", b"name,email\nBob,b@x.com\n");
    let first = pipeline.run_once().expect("first run");
    let MergeOutcome::Written { version: first_version, .. } = first.outcome else {
        panic!("expected Written outcome");
    };

    // the same rows arrive again under the same file names
    write_input(&config, "b.csv", b"name,email\nBob,b@x.com\n");
    write_input(&config, "a.csv", b"name,email\nAda,a@x.com\n");
    let second = pipeline.run_once().expect("second run");
    let MergeOutcome::Unchanged { version } = &second.outcome else {
        panic!("expected Unchanged outcome, got {:?}", second.outcome);
    };
    assert_eq!(version, &first_version);
}
