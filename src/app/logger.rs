//! Buffered output log: `b`/`d` lines for broadcast mode, one value line per
//! decided agreement.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::core::id::ProcessId;

/// Events buffered before the next write-out.
const FLUSH_THRESHOLD: usize = 1 << 21;

enum LogEvent {
    Delivered(ProcessId, u32),
    Decided(Vec<u32>),
}

struct Output {
    writer: BufWriter<File>,
    /// Highest broadcast value already written as a `b` line.
    sent_logged: u32,
}

/// Shutdown-safe delivery log. Deliveries and decisions are buffered in
/// memory; `b` lines are derived from a broadcast high-water mark rather
/// than stored per event. On shutdown the log is frozen first, so the flush
/// races no further record calls, then written out from the main task.
pub struct DeliveryLog {
    events: Mutex<Vec<LogEvent>>,
    output: Mutex<Output>,
    sent: AtomicU32,
    frozen: AtomicBool,
}

impl DeliveryLog {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            events: Mutex::new(Vec::new()),
            output: Mutex::new(Output {
                writer: BufWriter::new(file),
                sent_logged: 0,
            }),
            sent: AtomicU32::new(0),
            frozen: AtomicBool::new(false),
        })
    }

    /// Raises the broadcast high-water mark: values `1..=n` count as sent.
    pub fn record_sent(&self, n: u32) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.sent.fetch_max(n, Ordering::Release);
    }

    pub fn record_delivery(&self, sender: ProcessId, value: u32) {
        self.record(LogEvent::Delivered(sender, value));
    }

    pub fn record_decision(&self, decision: &HashSet<u32>) {
        let mut values: Vec<u32> = decision.iter().copied().collect();
        values.sort_unstable();
        self.record(LogEvent::Decided(values));
    }

    /// Stops all further recording. Call before the final [`Self::flush`].
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Writes pending `b` lines and buffered events to the output file.
    pub fn flush(&self) -> io::Result<()> {
        let events = std::mem::take(&mut *self.events.lock());
        let mut output = self.output.lock();

        let sent = self.sent.load(Ordering::Acquire);
        for n in output.sent_logged + 1..=sent {
            writeln!(output.writer, "b {n}")?;
        }
        output.sent_logged = output.sent_logged.max(sent);

        for event in events {
            match event {
                LogEvent::Delivered(sender, value) => {
                    writeln!(output.writer, "d {sender} {value}")?;
                }
                LogEvent::Decided(values) => {
                    let mut first = true;
                    for value in values {
                        if !first {
                            write!(output.writer, " ")?;
                        }
                        write!(output.writer, "{value}")?;
                        first = false;
                    }
                    writeln!(output.writer)?;
                }
            }
        }
        output.writer.flush()
    }

    fn record(&self, event: LogEvent) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        let full = {
            let mut events = self.events.lock();
            events.push(event);
            events.len() >= FLUSH_THRESHOLD
        };
        if full {
            if let Err(error) = self.flush() {
                warn!(%error, "log flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("argonaut-log-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn writes_broadcasts_then_deliveries() {
        let path = temp_path("basic");
        let log = DeliveryLog::create(&path).unwrap();
        log.record_sent(2);
        log.record_delivery(1, 1);
        log.record_delivery(2, 7);
        log.freeze();
        log.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "b 1\nb 2\nd 1 1\nd 2 7\n");
    }

    #[test]
    fn decision_lines_are_sorted_values() {
        let path = temp_path("decision");
        let log = DeliveryLog::create(&path).unwrap();
        log.record_decision(&HashSet::from([30, 10, 20]));
        log.record_decision(&HashSet::new());
        log.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "10 20 30\n\n");
    }

    #[test]
    fn freeze_stops_recording() {
        let path = temp_path("freeze");
        let log = DeliveryLog::create(&path).unwrap();
        log.record_delivery(1, 1);
        log.freeze();
        log.record_delivery(1, 2);
        log.record_sent(9);
        log.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "d 1 1\n");
    }

    #[test]
    fn repeated_flush_does_not_duplicate_b_lines() {
        let path = temp_path("reflush");
        let log = DeliveryLog::create(&path).unwrap();
        log.record_sent(1);
        log.flush().unwrap();
        log.record_sent(3);
        log.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "b 1\nb 2\nb 3\n");
    }
}
