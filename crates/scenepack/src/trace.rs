//! Stage progress reporting.
//!
//! The pipeline reports which stage is running on which file through a
//! small trait object rather than a logging framework, so embedders can
//! route progress wherever they want (or nowhere).

/// Receives one notification per (stage, file) pair as the pipeline runs.
pub trait StageTracer: Sync {
    /// Called when `stage` (e.g. `"CA"`, `"LZSS"`, `"OS"`) starts on `file`.
    fn stage(&self, stage: &str, file: &str);
}

/// Prints `STAGE: file` lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl StageTracer for StderrTracer {
    fn stage(&self, stage: &str, file: &str) {
        eprintln!("{stage}: {file}");
    }
}

/// Discards all notifications. Useful for tests and library embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl StageTracer for NoopTracer {
    fn stage(&self, _stage: &str, _file: &str) {}
}
