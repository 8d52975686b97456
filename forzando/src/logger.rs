//! Optional per-block CSV logging sidecar.
//!
//! The audio thread hands one row per rendered block to a writer thread
//! through a bounded channel; a full queue drops the row rather than block
//! the callback.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::JoinHandle;

use tracing::{debug, warn};

/// One render-block measurement.
#[derive(Clone, Copy, Debug)]
pub struct LogRow {
    pub time_samples: u64,
    pub num_active_voices: usize,
    pub callback_duration_us: u64,
    pub file_wait_time_us: u64,
}

/// Background CSV writer.
pub struct CsvLogger {
    tx: Option<SyncSender<LogRow>>,
    worker: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl CsvLogger {
    /// Create `<prefix>render_log.csv` and start the writer thread.
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let path = PathBuf::from(format!("{prefix}render_log.csv"));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "time_samples,num_active_voices,callback_duration_us,file_wait_time_us")?;

        let (tx, rx) = mpsc::sync_channel::<LogRow>(256);
        let worker = std::thread::Builder::new()
            .name("render-logger".into())
            .spawn(move || {
                while let Ok(row) = rx.recv() {
                    let _ = writeln!(
                        writer,
                        "{},{},{},{}",
                        row.time_samples,
                        row.num_active_voices,
                        row.callback_duration_us,
                        row.file_wait_time_us
                    );
                }
                let _ = writer.flush();
            })?;
        debug!("render log started at {:?}", path);
        Ok(Self { tx: Some(tx), worker: Some(worker), path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Queue one row; never blocks.
    pub fn log(&self, row: LogRow) {
        let Some(tx) = &self.tx else { return };
        match tx.try_send(row) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("render log queue full, dropping row"),
            Err(TrySendError::Disconnected(_)) => warn!("render log writer is gone"),
        }
    }
}

impl Drop for CsvLogger {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_reach_the_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("test_").to_string_lossy().into_owned();
        let logger = CsvLogger::create(&prefix).unwrap();
        for i in 0..5u64 {
            logger.log(LogRow {
                time_samples: i * 1024,
                num_active_voices: i as usize,
                callback_duration_us: 100 + i,
                file_wait_time_us: 0,
            });
        }
        let path = logger.path().clone();
        drop(logger); // joins the writer

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines[0],
            "time_samples,num_active_voices,callback_duration_us,file_wait_time_us"
        );
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[1], "0,0,100,0");
        assert_eq!(lines[5], "4096,4,104,0");
    }
}
