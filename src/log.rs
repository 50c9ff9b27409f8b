use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::dispatch::ConnectionContext;

/// Receives one summary line per request.
///
/// Called on the connection's own thread after the request has been resolved and before
/// the reply is written, so the status is the resolved one. Errors are ignored by the
/// caller.
pub trait Logger: Send + Sync {
    fn log(&self, ctx: &ConnectionContext, request: &str) -> std::io::Result<()>;
}

/// Adapts a closure into a [`Logger`].
pub struct FnLogger<F>(pub F);

impl<F> Logger for FnLogger<F>
where
    F: Fn(&ConnectionContext, &str) -> std::io::Result<()> + Send + Sync,
{
    fn log(&self, ctx: &ConnectionContext, request: &str) -> std::io::Result<()> {
        (self.0)(ctx, request)
    }
}

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(Mutex<BufWriter<File>>),
}

impl LogSink {
    /// Append to `filename`, creating it if needed.
    pub fn file(filename: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(filename)
            .with_context(|| format!("failed to open log file {}", filename.display()))?;
        Ok(Self::File(Mutex::new(BufWriter::new(file))))
    }

    pub fn write(&self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                let stdout = std::io::stdout();
                let mut stdout = stdout.lock();
                writeln!(stdout, "{}", message)?;
                stdout.flush()?;
            }
            Self::Syslog => {
                let message = CString::new(message)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let format = b"%s\0";
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        format.as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                let mut file = file
                    .lock()
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "poisoned"))?;
                writeln!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

impl Logger for LogSink {
    fn log(&self, _ctx: &ConnectionContext, request: &str) -> std::io::Result<()> {
        self.write(request)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Arc;

    use tempfile::tempdir;

    use crate::config::ServerConfig;

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "existing\n").unwrap();

        let config = Arc::new(ServerConfig::builder(dir.path()).build().unwrap());
        let ctx = ConnectionContext::new("127.0.0.1", config);
        let sink = LogSink::file(&path).unwrap();
        sink.log(&ctx, "first").unwrap();
        sink.log(&ctx, "second").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "existing\nfirst\nsecond\n"
        );
    }
}
