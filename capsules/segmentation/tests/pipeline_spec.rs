#![cfg(unix)]

use capsules_segmentation::{
    CaseId, OutputPolicy, Pipeline, PipelineConfig, PipelineError, RequestWorkspace, ResultStatus,
    SourcePaths,
};
use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use volume_io::{read_volume, write_volume, ElementType, Volume};

/// Executable stand-in for the container runtime. `run` resolves the host
/// paths bound to `/input` and `/output` into `$input` / `$output` and then
/// executes `run_body`.
fn fake_runtime(dir: &Path, run_body: &str) -> PathBuf {
    let path = dir.join("fake-runtime");
    let script = format!(
        r#"#!/bin/sh
case "$1" in
  --version) echo 'Fake runtime version 1.0'; exit 0 ;;
  kill) echo "$2" >> "$(dirname "$0")/killed"; exit 0 ;;
  run) shift ;;
  *) exit 64 ;;
esac
echo run >> "$(dirname "$0")/invocations"
input=""
output=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--mount" ]; then
    src=$(echo "$2" | sed -n 's/.*source=\([^,]*\),target=.*/\1/p')
    case "$2" in
      *target=/input,*) input="$src" ;;
      *target=/output,*) output="$src" ;;
    esac
    shift
  fi
  shift
done
detections="$output/images/cspca-detection-map"
{run_body}
"#
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

const COPY_T2W: &str = r#"cp "$input"/images/*_t2w.mha "$detections/cspca_detection_map.mha""#;

fn pipeline(runtime: &Path, timeout: Duration) -> Pipeline {
    Pipeline::new(PipelineConfig {
        runtime: runtime.to_string_lossy().to_string(),
        timeout,
        probe_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    })
}

fn synthetic_sources(dir: &Path, t2w_value: f64) -> SourcePaths {
    let write = |name: &str, value: f64| {
        let path = dir.join(name);
        write_volume(&Volume::filled([4, 4, 4], ElementType::F64, value).unwrap(), &path).unwrap();
        path
    };
    SourcePaths::new(
        write("t2w.nii.gz", t2w_value),
        write("adc.mha", 0.1),
        write("hbv.nii", 0.9),
    )
}

#[test]
fn copies_t2w_through_stub_model_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), COPY_T2W);
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();
    let case_id = CaseId::parse("case_001").unwrap();

    let result = pipeline(&runtime, Duration::from_secs(30))
        .run(&case_id, &sources, &workspace)
        .unwrap();

    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.statistics.total_voxels, 64);
    assert_eq!(result.statistics.positive_voxels, 64);
    assert_eq!(result.statistics.mean_probability, 0.6);
    assert_eq!(result.statistics.max_probability, 0.6);
    assert_eq!(
        result.t2w_path,
        workspace.images_dir().join("case_001_t2w.mha")
    );
    assert_eq!(
        fs::read(&result.prediction_path).unwrap(),
        fs::read(&result.t2w_path).unwrap()
    );
    assert!(result.prediction_path.starts_with(workspace.output_dir()));
    assert!(result.execution.as_ref().unwrap().is_success());

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["statistics"]["total_voxels"], 64);
}

#[test]
fn slow_model_times_out_and_container_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), "sleep 30");
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let started = Instant::now();
    let err = pipeline(&runtime, Duration::from_millis(300))
        .run_new_case(&sources, &workspace)
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(err.code(), "EXECUTION_TIMEOUT");
    let killed = fs::read_to_string(dir.path().join("killed")).unwrap();
    assert!(killed.trim().starts_with("segmentation-case_"));
}

#[test]
fn non_zero_exit_surfaces_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), "echo 'nnU-Net: CUDA out of memory' >&2\nexit 2");
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let err = pipeline(&runtime, Duration::from_secs(30))
        .run_new_case(&sources, &workspace)
        .unwrap_err();

    match &err {
        PipelineError::ExecutionFailure { exit_code, .. } => assert_eq!(*exit_code, Some(2)),
        other => panic!("unexpected error: {other}"),
    }
    let report = err.to_report();
    assert_eq!(report.code, "EXECUTION_FAILURE");
    assert!(report.diagnostics.unwrap().contains("CUDA out of memory"));
}

#[test]
fn clean_exit_without_prediction_is_output_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), "echo done\nexit 0");
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let err = pipeline(&runtime, Duration::from_secs(30))
        .run_new_case(&sources, &workspace)
        .unwrap_err();

    assert_eq!(err.code(), "OUTPUT_NOT_FOUND");
}

#[test]
fn reused_workspace_does_not_resolve_an_earlier_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(
        dir.path(),
        &format!(
            "marker=\"$(dirname \"$0\")/ran\"\nif [ ! -f \"$marker\" ]; then\n  touch \"$marker\"\n  {COPY_T2W}\nfi"
        ),
    );
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();
    let pipeline = pipeline(&runtime, Duration::from_secs(30));

    let first = pipeline.run_new_case(&sources, &workspace).unwrap();
    assert!(first.prediction_path.is_file());

    let err = pipeline.run_new_case(&sources, &workspace).unwrap_err();
    assert_eq!(err.code(), "OUTPUT_NOT_FOUND");
    assert!(!first.prediction_path.exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("invocations")).unwrap().lines().count(),
        2
    );
}

#[test]
fn prediction_with_wrong_shape_is_output_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = dir.path().join("small.mha");
    write_volume(&Volume::filled([2, 2, 2], ElementType::F32, 0.9).unwrap(), &fixture).unwrap();
    let runtime = fake_runtime(
        dir.path(),
        &format!("cp '{}' \"$detections/prediction.mha\"", fixture.display()),
    );
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let err = pipeline(&runtime, Duration::from_secs(30))
        .run_new_case(&sources, &workspace)
        .unwrap_err();

    assert_eq!(err.code(), "OUTPUT_READ_ERROR");
    assert!(err.to_string().contains("shape"));
}

#[test]
fn require_unique_rejects_multiple_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(
        dir.path(),
        r#"cp "$input"/images/*_t2w.mha "$detections/a.mha"
cp "$input"/images/*_adc.mha "$output/b.mha""#,
    );
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let strict = Pipeline::new(PipelineConfig {
        runtime: runtime.to_string_lossy().to_string(),
        output_policy: OutputPolicy::RequireUnique,
        ..PipelineConfig::default()
    });
    let err = strict.run_new_case(&sources, &workspace).unwrap_err();
    assert_eq!(err.code(), "AMBIGUOUS_OUTPUT");
}

#[test]
fn first_sorted_picks_lexicographically_first_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(
        dir.path(),
        r#"cp "$input"/images/*_t2w.mha "$detections/a.mha"
cp "$input"/images/*_adc.mha "$output/b.mha""#,
    );
    let sources = synthetic_sources(dir.path(), 0.6);
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let result = pipeline(&runtime, Duration::from_secs(30))
        .run_new_case(&sources, &workspace)
        .unwrap();

    // "b.mha" sorts before "images/..."
    assert_eq!(result.prediction_path, workspace.output_dir().join("b.mha"));
    assert_eq!(result.statistics.positive_voxels, 0);
}

#[test]
fn unreadable_source_stops_before_the_container_runs() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), COPY_T2W);
    let mut sources = synthetic_sources(dir.path(), 0.6);
    sources.adc = dir.path().join("does-not-exist.mha");
    let workspace = RequestWorkspace::claim(dir.path().join("ws")).unwrap();

    let err = pipeline(&runtime, Duration::from_secs(30))
        .run_new_case(&sources, &workspace)
        .unwrap_err();

    assert_eq!(err.code(), "STAGING_ERROR");
    assert!(!dir.path().join("invocations").exists());
}

#[test]
fn concurrent_requests_in_distinct_workspaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path(), &format!("sleep 0.2\n{COPY_T2W}"));
    let pipeline = pipeline(&runtime, Duration::from_secs(30));

    let values = [0.2, 0.4, 0.8];
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let case_dir = dir.path().join(format!("case-{i}"));
                fs::create_dir_all(&case_dir).unwrap();
                let sources = synthetic_sources(&case_dir, value);
                let pipeline = &pipeline;
                scope.spawn(move || {
                    let workspace = RequestWorkspace::claim(case_dir.join("ws")).unwrap();
                    pipeline.run_new_case(&sources, &workspace).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (result, value) in results.iter().zip(values) {
        assert_eq!(result.statistics.mean_probability, value);
        let prediction = read_volume(&result.prediction_path).unwrap();
        assert!(prediction.data().iter().all(|v| *v == value));
    }
    let case_ids: HashSet<_> = results.iter().map(|r| r.case_id.clone()).collect();
    assert_eq!(case_ids.len(), values.len());
}
