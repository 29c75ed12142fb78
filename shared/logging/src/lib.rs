//! Process-wide `tracing` setup for nanorun commands.
//!
//! Every rank of a run logs to its own stdout. When a log file is requested,
//! ranks launched together would otherwise share it, so each rank writes to
//! its own file next to the requested one (`run.log` becomes `run.rank3.log`).

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use anyhow::Context;
use clap::ValueEnum;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    filter::FromEnvError, fmt, layer::SubscriberExt, registry::LookupSpan, EnvFilter, Layer,
    Registry,
};

/// Environment variable that overrides the filter for the log file only.
pub const WRITE_RUST_LOG_VAR: &str = "WRITE_RUST_LOG";

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    log_file: Option<PathBuf>,
    rank: Option<usize>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            log_file: None,
            rank: None,
        }
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Append detailed logs to this file as well.
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.log_file = path.into();
        self
    }

    /// The launcher rank of this process, if it has one. Gives the log file a
    /// per-rank name.
    pub fn with_rank(mut self, rank: Option<usize>) -> Self {
        self.rank = rank;
        self
    }

    /// The file this builder will write to, after the per-rank rename.
    pub fn log_file_path(&self) -> Option<PathBuf> {
        self.log_file
            .as_deref()
            .map(|path| rank_log_path(path, self.rank))
    }

    /// Installs the global subscriber. Fails if one is already installed.
    pub fn init(self) -> anyhow::Result<()> {
        let mut layers: Vec<BoxedLayer<Registry>> = Vec::new();
        if let Some(layer) = output_layer(self.output, self.level)? {
            layers.push(layer);
        }
        if let Some(path) = self.log_file_path() {
            layers.push(file_layer(&path, self.level)?);
        }

        tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))?;
        Ok(())
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

/// `run.log` for rank 3 becomes `run.rank3.log`; an extensionless `run`
/// becomes `run.rank3`.
fn rank_log_path(path: &Path, rank: Option<usize>) -> PathBuf {
    let Some(rank) = rank else {
        return path.to_owned();
    };
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.rank{rank}.{}", ext.to_string_lossy()),
        None => format!("{stem}.rank{rank}"),
    };
    path.with_file_name(name)
}

// tokio's own spans drown out ours
fn without_runtime_noise(filter: EnvFilter) -> anyhow::Result<EnvFilter> {
    Ok(filter
        .add_directive("tokio=off".parse()?)
        .add_directive("runtime=off".parse()?))
}

fn output_layer<S>(output: LogOutput, level: Level) -> anyhow::Result<Option<BoxedLayer<S>>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = without_runtime_noise(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    )?;
    Ok(match output {
        LogOutput::Console => Some(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(filter)
                .boxed(),
        ),
        LogOutput::Json => Some(
            fmt::layer()
                .json()
                .with_writer(std::io::stdout)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(filter)
                .boxed(),
        ),
        LogOutput::None => None,
    })
}

fn file_filter(level: Level) -> Result<EnvFilter, FromEnvError> {
    let builder = EnvFilter::builder();
    if std::env::var(WRITE_RUST_LOG_VAR).is_ok() {
        builder.with_env_var(WRITE_RUST_LOG_VAR).from_env()
    } else {
        builder.with_default_directive(level.into()).from_env()
    }
}

fn file_layer<S>(path: &Path, level: Level) -> anyhow::Result<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let log_file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("could not open log file {}", path.display()))?;

    Ok(fmt::layer()
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(without_runtime_noise(file_filter(level)?)?)
        .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_get_their_own_log_file() {
        let path = Path::new("/tmp/nanorun/run.log");
        assert_eq!(rank_log_path(path, None), path);
        assert_eq!(
            rank_log_path(path, Some(3)),
            Path::new("/tmp/nanorun/run.rank3.log")
        );
        assert_eq!(
            rank_log_path(Path::new("logs/run"), Some(0)),
            Path::new("logs/run.rank0")
        );
    }

    #[test]
    fn builder_reports_the_renamed_file() {
        let builder = logging()
            .with_log_file(PathBuf::from("out.log"))
            .with_rank(Some(7));
        assert_eq!(builder.log_file_path(), Some(PathBuf::from("out.rank7.log")));
        assert_eq!(logging().log_file_path(), None);
    }

    #[test]
    fn unopenable_log_file_is_named() {
        let err = logging()
            .with_output(LogOutput::None)
            .with_log_file(PathBuf::from("/nonexistent/dir/run.log"))
            .init()
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dir/run.log"), "{err}");
    }
}
