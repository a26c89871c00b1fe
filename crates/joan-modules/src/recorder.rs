//! [`DataRecorder`] – writes every module's news to disk.
//!
//! Each run produces one JSON-lines file `data_<YYYYmmdd_HHMMSS>.jsonl` in
//! the configured output directory.  Every tick appends one line:
//!
//! ```json
//! {"timestamp":"2024-05-01T12:00:00.000+02:00","news":{"hardware_manager":{...}}}
//! ```
//!
//! Modules are discovered through [`News::available_keys`] on every tick, so
//! a module that is initialized while recording appears from its first
//! published record onwards.  The recorder never records itself.
//!
//! [`News::available_keys`]: joan_news::News::available_keys

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use joan_core::{Module, TickContext, TickOutcome, WorkerAction};
use joan_types::{JoanError, ModuleId, SharedValues, State, impl_shared_values};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecorderValues {
    pub state: State,
    /// File of the current (or last) run.
    pub file: Option<PathBuf>,
    /// Lines written in the current run.
    pub lines: u64,
}
impl_shared_values!(RecorderValues);

pub struct DataRecorder {
    output_dir: PathBuf,
}

impl DataRecorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// `data_<YYYYmmdd_HHMMSS>.jsonl` for the current local time.
pub fn recording_file_name() -> String {
    format!("data_{}.jsonl", Local::now().format("%Y%m%d_%H%M%S"))
}

fn io_failure(module: ModuleId, what: &str, err: std::io::Error) -> JoanError {
    JoanError::WorkerFailure {
        module,
        details: format!("{what}: {err}"),
    }
}

impl Module for DataRecorder {
    fn id(&self) -> ModuleId {
        ModuleId::DataRecorder
    }

    fn shared_values(&self) -> Box<dyn SharedValues> {
        Box::new(RecorderValues::default())
    }

    fn worker_action(&self) -> Result<Box<dyn WorkerAction>, JoanError> {
        Ok(Box::new(Recording {
            output_dir: self.output_dir.clone(),
            writer: None,
            lines: 0,
        }))
    }

    fn on_initialize(&self) -> Result<(), JoanError> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            JoanError::Configuration(format!(
                "cannot create output directory {}: {e}",
                self.output_dir.display()
            ))
        })
    }
}

struct Recording {
    output_dir: PathBuf,
    writer: Option<BufWriter<File>>,
    lines: u64,
}

impl Recording {
    fn line(ctx: &TickContext<'_>) -> Value {
        let news = ctx.news();
        let records: Map<String, Value> = news
            .available_keys()
            .filter(|id| *id != ctx.module())
            .filter_map(|id| news.snapshot(id).map(|v| (id.key().to_string(), v)))
            .collect();
        json!({
            "timestamp": Local::now().to_rfc3339(),
            "news": records,
        })
    }
}

impl WorkerAction for Recording {
    fn on_start(&mut self, ctx: &TickContext<'_>) -> Result<(), JoanError> {
        let path = self.output_dir.join(recording_file_name());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_failure(ctx.module(), "cannot open recording", e))?;
        self.writer = Some(BufWriter::new(file));
        self.lines = 0;
        info!(module = %ctx.module(), path = %path.display(), "recording started");
        ctx.news().update_as(ctx.module(), |v: &mut RecorderValues| {
            v.file = Some(path);
            v.lines = 0;
        });
        Ok(())
    }

    fn tick(&mut self, ctx: &TickContext<'_>) -> Result<TickOutcome, JoanError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(JoanError::WorkerFailure {
                module: ctx.module(),
                details: "recording file is not open".to_string(),
            });
        };
        let line = Self::line(ctx);
        serde_json::to_writer(&mut *writer, &line).map_err(|e| JoanError::WorkerFailure {
            module: ctx.module(),
            details: format!("cannot encode record: {e}"),
        })?;
        writer
            .write_all(b"\n")
            .map_err(|e| io_failure(ctx.module(), "cannot write record", e))?;

        self.lines += 1;
        let lines = self.lines;
        ctx.news()
            .update_as(ctx.module(), |v: &mut RecorderValues| v.lines = lines);
        Ok(TickOutcome::Continue)
    }

    fn on_stop(&mut self, ctx: &TickContext<'_>) -> Result<(), JoanError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| io_failure(ctx.module(), "cannot flush recording", e))?;
            debug!(module = %ctx.module(), lines = self.lines, "recording closed");
        }
        Ok(())
    }
}
