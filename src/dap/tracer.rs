use anyhow::Context;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Append-only file sink for raw DAP traffic and session lifecycle notes.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
    session: Option<u64>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            session: None,
        })
    }

    /// Tracer sharing the same file whose lines are tagged with a session number.
    pub fn for_session(&self, session: u64) -> Self {
        Self {
            file: self.file.clone(),
            session: Some(session),
        }
    }

    pub fn line(&self, text: &str) {
        let mut file = self.file.lock();
        let _ = match self.session {
            Some(session) => writeln!(file, "[{session}] {text}"),
            None => writeln!(file, "{text}"),
        };
    }
}
