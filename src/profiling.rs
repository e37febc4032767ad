//! Chrome Tracing collector for scheduler diagnostics.
//!
//! Records spans into thread-local buffers: job bursts on fiber threads, idle
//! waits of the retrieval loop and contended [`LightweightMutex`] acquisitions.
//! Buffers are gathered globally and exported to a JSON file readable by
//! chrome://tracing or ui.perfetto.dev.
//!
//! Recording is off until [`set_enabled`] is called and never changes
//! scheduling behaviour.
//!
//! [`LightweightMutex`]: crate::mutex::LightweightMutex

use crate::fiber_thread;
use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::Location;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Kind of span, exported as the Chrome `cat` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// A job running on a fiber until it finishes or suspends.
    Job,
    /// A fiber thread sleeping on the manager's condition variable.
    Idle,
    /// Time spent acquiring a contended lock.
    Lock,
}

impl Category {
    fn as_str(self) -> &'static str {
        match self {
            Category::Job => "job",
            Category::Idle => "idle",
            Category::Lock => "lock",
        }
    }
}

/// A single trace event in Chrome Tracing format.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub name: &'static str,
    pub category: Category,
    pub tid: usize,
    pub start_us: u64,
    pub duration_us: u64,
    pub mark: Option<&'static Location<'static>>,
}

static ENABLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref EPOCH_START_US: u64 = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

pub fn set_enabled(enabled: bool) {
    if enabled {
        // Pin the time origin before the first span.
        lazy_static::initialize(&GLOBAL_START);
        lazy_static::initialize(&EPOCH_START_US);
    }
    ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Trace thread id of the caller: fiber threads are numbered from 1, every
/// other thread shares id 0.
fn current_tid() -> usize {
    fiber_thread::current_index().map_or(0, |index| index as usize + 1)
}

/// Records a span that started at `start` and ends now.
pub fn record_event(
    name: &'static str,
    category: Category,
    start: Instant,
    mark: Option<&'static Location<'static>>,
) {
    record_span(name, category, start, start.elapsed(), mark);
}

fn record_span(
    name: &'static str,
    category: Category,
    start: Instant,
    duration: Duration,
    mark: Option<&'static Location<'static>>,
) {
    if !is_enabled() {
        return;
    }

    let since_origin = start.saturating_duration_since(*GLOBAL_START);
    let event = TraceEvent {
        name,
        category,
        tid: current_tid(),
        start_us: since_origin.as_micros() as u64 + *EPOCH_START_US,
        duration_us: duration.as_micros() as u64,
        mark,
    };

    TRACE_BUFFER.with(|buf| buf.borrow_mut().push(event));
}

/// Moves the calling thread's buffer into the global list.
///
/// Fiber threads do this on exit; other threads must call it themselves.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(std::mem::take(&mut *local));
        }
    });
}

/// Number of collected events, local buffers excluded.
pub fn collected_event_count() -> usize {
    ALL_BUFFERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(Vec::len)
        .sum()
}

/// Drops every collected event.
pub fn clear() {
    ALL_BUFFERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

/// Writes all collected events as a Chrome trace JSON array.
pub fn write_trace<W: Write>(writer: &mut W) -> io::Result<()> {
    let buffers = ALL_BUFFERS.lock().unwrap_or_else(PoisonError::into_inner);

    writeln!(writer, "[")?;
    let mut first = true;

    for event in buffers.iter().flatten() {
        if !first {
            writeln!(writer, ",")?;
        }
        first = false;

        // ph: X is "Complete Event" (requires dur)
        write!(
            writer,
            "{{\"name\":\"{}\",\"cat\":\"{}\",\"ph\":\"X\",\"ts\":{},\"dur\":{},\"pid\":1,\"tid\":{}",
            escape(event.name),
            event.category.as_str(),
            event.start_us,
            event.duration_us,
            event.tid
        )?;
        if let Some(mark) = event.mark {
            write!(
                writer,
                ",\"args\":{{\"mark\":\"{}:{}\"}}",
                escape(mark.file()),
                mark.line()
            )?;
        }
        write!(writer, "}}")?;
    }

    writeln!(writer, "\n]")?;
    writer.flush()
}

/// Exports all collected events to a JSON file.
pub fn export_to_file(path: impl AsRef<Path>) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_trace(&mut writer)
}

/// Escapes `text` for a JSON string literal.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Records a span covering its own lifetime.
pub struct TraceGuard {
    name: &'static str,
    category: Category,
    start: Option<Instant>,
}

impl TraceGuard {
    pub fn new(name: &'static str, category: Category) -> Self {
        Self {
            name,
            category,
            start: is_enabled().then(Instant::now),
        }
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            record_event(self.name, self.category, start, None);
        }
    }
}

/// Collects the local trace when dropped.
pub struct CollectorGuard;

impl Drop for CollectorGuard {
    fn drop(&mut self) {
        collect_local_trace();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Profiling state is process-global; keep every assertion in one test.
    #[test]
    fn test_record_collect_and_write() {
        set_enabled(true);
        std::thread::spawn(|| {
            let _collector = CollectorGuard;
            let _span = TraceGuard::new("unit \"span\"", Category::Job);
            let _multiline = TraceGuard::new("first\nsecond\tthird", Category::Job);
            record_event("marked", Category::Lock, Instant::now(), Some(Location::caller()));
        })
        .join()
        .unwrap();
        set_enabled(false);

        std::thread::spawn(|| {
            let _collector = CollectorGuard;
            let _span = TraceGuard::new("ignored", Category::Idle);
        })
        .join()
        .unwrap();

        assert!(collected_event_count() >= 2);

        let mut out = Vec::new();
        write_trace(&mut out).unwrap();
        let json = String::from_utf8(out).unwrap();
        assert!(json.starts_with('['));
        assert!(json.contains("unit \\\"span\\\""));
        assert!(json.contains("\"cat\":\"lock\""));
        assert!(json.contains("\"mark\":"));
        assert!(!json.contains("ignored"));
        assert!(json.contains("first\\nsecond\\tthird"));

        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.as_array().is_some_and(|events| events.len() >= 3));
    }

    #[test]
    fn test_escape_control_characters() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(escape("a\nb\r\tc"), "a\\nb\\r\\tc");
        assert_eq!(escape("\u{1}\u{1f}"), "\\u0001\\u001f");
        assert_eq!(escape("é"), "é");
    }
}
