/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info};

use crate::utils::queue::{Error, Receiver};
use crate::utils::stats::{self, Countable, Counter, CounterType, CounterValue, OwnedCountable};

pub const METRIC_FILE_NAME: &str = "flow_metrics.json";

const QUEUE_READ_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Default)]
pub struct SenderCounter {
    pub tx: AtomicU64,
    pub tx_bytes: AtomicU64,
}

struct SenderStatsHandle {
    counter: Arc<SenderCounter>,
}

impl OwnedCountable for SenderStatsHandle {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "tx",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.tx.swap(0, Ordering::Relaxed)),
            ),
            (
                "tx-bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.counter.tx_bytes.swap(0, Ordering::Relaxed)),
            ),
        ]
    }

    fn closed(&self) -> bool {
        false
    }
}

/// Consumes serialized metric records and writes them to the output file,
/// one JSON object per line. The file is recreated on startup with mode
/// 0644; records are separated by single newlines with no trailing
/// newline after the last one. The writer drains its queue after the
/// producers close it, then terminates.
pub struct MetricSenderThread {
    sender: Option<MetricSender>,
    thread_handle: Option<JoinHandle<u64>>,
}

impl MetricSenderThread {
    pub fn new(
        input: Receiver<String>,
        directory: PathBuf,
        stats_collector: &stats::Collector,
    ) -> Self {
        let counter = Arc::new(SenderCounter::default());
        stats_collector.register_countable(
            "metric-sender",
            Countable::Owned(Box::new(SenderStatsHandle {
                counter: counter.clone(),
            })),
            vec![],
        );
        Self {
            sender: Some(MetricSender {
                input,
                path: directory.join(METRIC_FILE_NAME),
                counter,
            }),
            thread_handle: None,
        }
    }

    pub fn start(&mut self) {
        let sender = self.sender.take().unwrap();
        info!("starting metric sender, writing to {}", sender.path.display());
        self.thread_handle = Some(thread::spawn(move || sender.process()));
    }

    // Blocks until the export queue has been drained and the file closed.
    // Returns the number of records written; a writer that died on an I/O
    // error surfaces here as Err.
    pub fn join(&mut self) -> io::Result<u64> {
        match self.thread_handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "metric writer failed")),
            None => Ok(0),
        }
    }
}

struct MetricSender {
    input: Receiver<String>,
    path: PathBuf,
    counter: Arc<SenderCounter>,
}

impl MetricSender {
    fn create_file(&self) -> io::Result<File> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        let file = File::create(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o644))?;
        }
        Ok(file)
    }

    // Write failures are fatal: a half-written record would taint the
    // whole output file, and letting the queue back up would stall the
    // shards behind it.
    fn process(self) -> u64 {
        let file = match self.create_file() {
            Ok(file) => file,
            Err(e) => panic!("cannot create '{}': {}", self.path.display(), e),
        };
        let mut writer = BufWriter::new(file);
        let mut written = 0u64;
        // hold one record back so the final one is written without a
        // trailing newline
        let mut pending: Option<String> = None;
        loop {
            match self.input.recv(Some(QUEUE_READ_TIMEOUT)) {
                Ok(record) => {
                    if let Some(previous) = pending.take() {
                        self.write_record(&mut writer, &previous, true);
                        written += 1;
                    }
                    pending = Some(record);
                }
                Err(Error::Timeout) => {
                    debug!("metric export queue idle");
                    if let Err(e) = writer.flush() {
                        panic!("cannot write '{}': {}", self.path.display(), e);
                    }
                }
                Err(_) => {
                    if let Some(previous) = pending.take() {
                        self.write_record(&mut writer, &previous, false);
                        written += 1;
                    }
                    break;
                }
            }
        }
        if let Err(e) = writer.flush() {
            panic!("cannot write '{}': {}", self.path.display(), e);
        }
        info!("metric sender finished, {} records written", written);
        written
    }

    fn write_record(&self, writer: &mut BufWriter<File>, record: &str, newline: bool) {
        let result = writer
            .write_all(record.as_bytes())
            .and_then(|_| if newline { writer.write_all(b"\n") } else { Ok(()) });
        if let Err(e) = result {
            panic!("cannot write '{}': {}", self.path.display(), e);
        }
        self.counter.tx.fetch_add(1, Ordering::Relaxed);
        self.counter
            .tx_bytes
            .fetch_add(record.len() as u64 + newline as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::utils::queue;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flowmeter-sender-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn newline_discipline() {
        let dir = temp_dir("lines");
        let (s, r, _) = queue::bounded(16);
        let mut sender = MetricSenderThread::new(r, dir.clone(), &stats::Collector::new());
        sender.start();

        s.send("{\"a\":1}".to_string()).unwrap();
        s.send("{\"b\":2}".to_string()).unwrap();
        s.send("{\"c\":3}".to_string()).unwrap();
        drop(s);

        assert_eq!(sender.join().unwrap(), 3);
        let content = fs::read_to_string(dir.join(METRIC_FILE_NAME)).unwrap();
        assert_eq!(content, "{\"a\":1}\n{\"b\":2}\n{\"c\":3}");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_input_empty_file() {
        let dir = temp_dir("empty");
        let (s, r, _) = queue::bounded::<String>(16);
        let mut sender = MetricSenderThread::new(r, dir.clone(), &stats::Collector::new());
        sender.start();
        drop(s);

        assert_eq!(sender.join().unwrap(), 0);
        let content = fs::read_to_string(dir.join(METRIC_FILE_NAME)).unwrap();
        assert!(content.is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn recreates_existing_file() {
        let dir = temp_dir("recreate");
        fs::write(dir.join(METRIC_FILE_NAME), "stale").unwrap();

        let (s, r, _) = queue::bounded(16);
        let mut sender = MetricSenderThread::new(r, dir.clone(), &stats::Collector::new());
        sender.start();
        s.send("{}".to_string()).unwrap();
        drop(s);
        sender.join().unwrap();

        let content = fs::read_to_string(dir.join(METRIC_FILE_NAME)).unwrap();
        assert_eq!(content, "{}");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.join(METRIC_FILE_NAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o644);
        }
        let _ = fs::remove_dir_all(&dir);
    }
}
