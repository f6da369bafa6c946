use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

const MAX_BYTES: u64 = 5 * 1024 * 1024;
const BACKUPS: usize = 5;

/// Append-only log file rotated at 5 MB with 5 numbered backups
/// (`app.log.1` is the most recent). Shared by the application log
/// (as a `MakeWriter` for tracing) and the dedicated data logs.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingInner>>,
}

struct RotatingInner {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingWriter {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingInner {
                path,
                file,
                written,
            })),
        })
    }

    pub fn write_line(&self, line: &str) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.write_all(line.as_bytes()).ok();
        inner.write_all(b"\n").ok();
    }
}

impl RotatingInner {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for idx in (1..BACKUPS).rev() {
            let from = backup_path(&self.path, idx);
            if from.exists() {
                fs::rename(&from, backup_path(&self.path, idx + 1))?;
            }
        }
        fs::rename(&self.path, backup_path(&self.path, 1))?;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, idx: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", idx));
    PathBuf::from(name)
}

impl Write for RotatingInner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_BYTES {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

pub struct RotatingGuard<'a>(std::sync::MutexGuard<'a, RotatingInner>);

impl Write for RotatingGuard<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingGuard<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.inner.lock() {
            Ok(guard) => RotatingGuard(guard),
            Err(poisoned) => RotatingGuard(poisoned.into_inner()),
        }
    }
}

/// Dedicated data logs written alongside the application log: hangup
/// tracing, user-drop timing, and per-intent transcripts.
pub struct CallLogs {
    pub hangups: RotatingWriter,
    pub userdrop: RotatingWriter,
    pub positive_stt: RotatingWriter,
    pub negative_stt: RotatingWriter,
    pub unknown_stt: RotatingWriter,
}

impl CallLogs {
    pub fn open(log_dir: &str) -> io::Result<Self> {
        let dir = Path::new(log_dir);
        Ok(Self {
            hangups: RotatingWriter::open(dir.join("hangups.log"))?,
            userdrop: RotatingWriter::open(dir.join("userdrop.log"))?,
            positive_stt: RotatingWriter::open(dir.join("positive_stt.log"))?,
            negative_stt: RotatingWriter::open(dir.join("negative_stt.log"))?,
            unknown_stt: RotatingWriter::open(dir.join("unknown_stt.log"))?,
        })
    }
}

pub fn stamp(line: &str) -> String {
    format!("{} {}", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let writer = RotatingWriter::open(&path).unwrap();
        writer.write_line("hello");
        assert!(path.exists());

        {
            let mut inner = writer.inner.lock().unwrap();
            inner.written = MAX_BYTES;
        }
        writer.write_line("post-rotation");
        assert!(backup_path(&path, 1).exists());
        let current = fs::read_to_string(&path).unwrap();
        assert!(current.contains("post-rotation"));
        assert!(!current.contains("hello"));
    }

    #[test]
    fn test_backup_shift_keeps_five() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shift.log");
        let writer = RotatingWriter::open(&path).unwrap();
        for _ in 0..7 {
            {
                let mut inner = writer.inner.lock().unwrap();
                inner.written = MAX_BYTES;
            }
            writer.write_line("x");
        }
        assert!(backup_path(&path, BACKUPS).exists());
        assert!(!backup_path(&path, BACKUPS + 1).exists());
    }
}
