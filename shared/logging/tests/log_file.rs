use nanorun_logging::{logging, LogOutput};
use tracing::Level;

#[test]
fn file_layer_receives_events_once() {
    let dir = tempfile::tempdir().unwrap();
    let requested = dir.path().join("run.log");
    let builder = logging()
        .with_output(LogOutput::None)
        .with_level(Level::DEBUG)
        .with_log_file(requested.clone())
        .with_rank(Some(0));
    let path = builder.log_file_path().unwrap();
    assert_eq!(path, dir.path().join("run.rank0.log"));
    builder.init().unwrap();

    tracing::info!(rank = 0, "process group ready");
    tracing::debug!("detail");

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("process group ready"));
    assert!(written.contains("rank=0"));
    assert!(written.contains("detail"));
    assert!(!requested.exists());

    // only one global subscriber per process
    assert!(logging().with_output(LogOutput::None).init().is_err());
}
