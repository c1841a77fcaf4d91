use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{event, instrument, Level};

/// Counter sharded per thread; workers increment their own slot and readers sum all slots.
#[derive(Debug)]
pub struct TlsCounter {
    count: thread_local::ThreadLocal<AtomicU64>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        self.count
            .get_or(|| AtomicU64::new(0))
            .fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count
            .iter()
            .fold(0, |total, slot| total + slot.load(Ordering::Relaxed))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

impl Default for ProgressCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self {
            started: TlsCounter::new(),
            finished: TlsCounter::new(),
        }
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        let mut status = Status {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Live counters of a migration run
#[derive(Debug)]
pub struct Progress {
    pub ops: ProgressCounter,
    pub objects_listed: TlsCounter,
    pub objects_copied: TlsCounter,
    pub manifests_uploaded: TlsCounter,
    pub bytes_copied: TlsCounter,
    pub bytes_hashed: TlsCounter,
    pub objects_skipped: TlsCounter,
    pub copies_retried: TlsCounter,
    pub objects_failed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            ops: Default::default(),
            objects_listed: Default::default(),
            objects_copied: Default::default(),
            manifests_uploaded: Default::default(),
            bytes_copied: Default::default(),
            bytes_hashed: Default::default(),
            objects_skipped: Default::default(),
            copies_retried: Default::default(),
            objects_failed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_ops: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_ops: progress.ops.get().finished,
            last_bytes: progress.bytes_copied.get() + progress.bytes_hashed.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let ops = self.progress.ops.get();
        let total_duration_secs = self.progress.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let average_ops_rate = ops.finished as f64 / total_duration_secs;
        let current_ops_rate = (ops.finished - self.last_ops) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_copied.get() + self.progress.bytes_hashed.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        self.last_ops = ops.finished;
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "---------------------\n\
            OBJECTS:\n\
            listed:  {:>10}\n\
            pending: {:>10}\n\
            average: {:>10.2} items/s\n\
            current: {:>10.2} items/s\n\
            -----------------------\n\
            THROUGHPUT:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            copied:  {:>10}\n\
            hashed:  {:>10}\n\
            -----------------------\n\
            copied:    {:>10}\n\
            manifests: {:>10}\n\
            skipped:   {:>10}\n\
            retried:   {:>10}\n\
            failed:    {:>10}",
            self.progress.objects_listed.get(),
            ops.started - ops.finished,
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(self.progress.bytes_copied.get()),
            bytesize::ByteSize(self.progress.bytes_hashed.get()),
            self.progress.objects_copied.get(),
            self.progress.manifests_uploaded.get(),
            self.progress.objects_skipped.get(),
            self.progress.copies_retried.get(),
            self.progress.objects_failed.get(),
        )
    }

    /// Single line variant for spinners
    pub fn print_line(&self) -> String {
        let ops = self.progress.ops.get();
        format!(
            "{} pending | {} copied | {} manifests | {} skipped | {} failed | {} hashed",
            ops.started - ops.finished,
            self.progress.objects_copied.get(),
            self.progress.manifests_uploaded.get(),
            self.progress.objects_skipped.get(),
            self.progress.objects_failed.get(),
            bytesize::ByteSize(self.progress.bytes_hashed.get()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn guard_tracks_pending() -> Result<()> {
        let counter = ProgressCounter::new();
        {
            let _guard = counter.guard();
            let status = counter.get();
            assert_eq!(status.started - status.finished, 1);
        }
        let status = counter.get();
        assert_eq!(status.started, 1);
        assert_eq!(status.finished, 1);
        Ok(())
    }

    #[test]
    fn printer_reports_counters() -> Result<()> {
        let progress = Progress::new();
        progress.objects_copied.add(3);
        progress.objects_failed.inc();
        let mut printer = ProgressPrinter::new(&progress);
        let text = printer.print();
        assert!(
            text.lines()
                .any(|line| line.starts_with("copied:") && line.ends_with(" 3"))
        );
        assert!(printer.print_line().contains("1 failed"));
        Ok(())
    }
}
