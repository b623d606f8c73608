use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const LOG_FILE_NAME: &str = "convo.log";

type SharedFile = Arc<Mutex<File>>;

/// Keeps the mirrored log file open for the life of the process.
pub struct LogGuard {
    _file: Option<SharedFile>,
}

pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<LogGuard> {
    let file = log_dir.and_then(|dir| match open_log_file(dir) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    });

    let tee_file = file.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_writer(BoxMakeWriter::new(move || StderrTee {
            file: tee_file.clone(),
        }))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { _file: file })
}

/// `RUST_LOG` wins, then `--debug`, then `CONVO_LOG_LEVEL`, then `info`.
fn env_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match (debug, std::env::var("CONVO_LOG_LEVEL")) {
            (true, _) => "debug".to_string(),
            (false, Ok(level)) => level,
            (false, Err(_)) => "info".to_string(),
        };
        EnvFilter::new(level)
    })
}

fn open_log_file(dir: &Path) -> io::Result<SharedFile> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;
    Ok(Arc::new(Mutex::new(file)))
}

/// Stderr plus the optional log file. Stdout is reserved for command output.
struct StderrTee {
    file: Option<SharedFile>,
}

impl StderrTee {
    fn with_file(&self, op: impl FnOnce(&mut File) -> io::Result<()>) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = op(&mut *file);
        }
    }
}

impl Write for StderrTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        self.with_file(|file| file.write_all(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        self.with_file(|file| file.flush());
        Ok(())
    }
}
