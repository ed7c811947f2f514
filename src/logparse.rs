//! Parsing CRIU logs into structured events.
//!
//! CRIU log lines look like `(  0.123456) <pid> <message>`. The
//! object-storage and prefetch instrumentation emit structured messages
//! on top of that:
//!
//! ```text
//! (  0.123456) 4242 objstor: FETCH_DONE key=foo offset=0 len=4096 dur_ms=1.5
//! (  0.123456) 4242 prefetch: QUEUE iov_idx=3 iov_start=0x7f00 iov_end=0x8000 priority=1
//! ```
//!
//! Events classify into a closed kind enumeration; anything recognizable
//! as neither a structured event nor a dump/restore/fault line falls back
//! to `Info` or `Error`.

use std::io::{BufRead, BufReader};
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DumpStart,
    DumpPages,
    DumpEnd,
    RestoreStart,
    RestorePages,
    RestoreEnd,
    LazyFault,
    ObjstorFetchStart,
    ObjstorFetchDone,
    ObjstorFetchError,
    PrefetchQueue,
    PrefetchDequeue,
    PrefetchWorkerStart,
    PrefetchWorkerDone,
    PrefetchWorkerError,
    PrefetchCacheHit,
    PrefetchCacheMiss,
    PrefetchCacheStore,
    PrefetchControllerFault,
    PrefetchControllerPromote,
    PrefetchControllerRemove,
    PrefetchStats,
    Info,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DumpStart => "dump_start",
            EventKind::DumpPages => "dump_pages",
            EventKind::DumpEnd => "dump_end",
            EventKind::RestoreStart => "restore_start",
            EventKind::RestorePages => "restore_pages",
            EventKind::RestoreEnd => "restore_end",
            EventKind::LazyFault => "lazy_fault",
            EventKind::ObjstorFetchStart => "objstor_fetch_start",
            EventKind::ObjstorFetchDone => "objstor_fetch_done",
            EventKind::ObjstorFetchError => "objstor_fetch_error",
            EventKind::PrefetchQueue => "prefetch_queue",
            EventKind::PrefetchDequeue => "prefetch_dequeue",
            EventKind::PrefetchWorkerStart => "prefetch_worker_start",
            EventKind::PrefetchWorkerDone => "prefetch_worker_done",
            EventKind::PrefetchWorkerError => "prefetch_worker_error",
            EventKind::PrefetchCacheHit => "prefetch_cache_hit",
            EventKind::PrefetchCacheMiss => "prefetch_cache_miss",
            EventKind::PrefetchCacheStore => "prefetch_cache_store",
            EventKind::PrefetchControllerFault => "prefetch_controller_fault",
            EventKind::PrefetchControllerPromote => "prefetch_controller_promote",
            EventKind::PrefetchControllerRemove => "prefetch_controller_remove",
            EventKind::PrefetchStats => "prefetch_stats",
            EventKind::Info => "info",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub timestamp_sec: f64,
    pub pid: u32,
    pub event_kind: EventKind,
    pub message: String,
    pub details: Map<String, Value>,
}

pub struct LogParser {
    line: Regex,
    objstor_fetch_start: Regex,
    objstor_fetch_done: Regex,
    objstor_fetch_error: Regex,
    prefetch_queue: Regex,
    prefetch_dequeue: Regex,
    prefetch_worker_start: Regex,
    prefetch_worker_done: Regex,
    prefetch_worker_error: Regex,
    prefetch_cache_hit: Regex,
    prefetch_cache_miss: Regex,
    prefetch_cache_store: Regex,
    prefetch_controller_fault: Regex,
    prefetch_controller_promote: Regex,
    prefetch_controller_remove: Regex,
    prefetch_stats: Regex,
    fault_addr: Regex,
    dump_pages: Regex,
    restore_pages: Regex,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

impl LogParser {
    pub fn new() -> Self {
        LogParser {
            line: re(r"^\(\s*(\d+\.\d+)\)\s+(\d+)\s+(.*)$"),
            objstor_fetch_start: re(r"objstor:\s*FETCH_START\s+key=(\S+)\s+offset=(\d+)\s+len=(\d+)"),
            objstor_fetch_done: re(
                r"objstor:\s*FETCH_DONE\s+key=(\S+)\s+offset=(\d+)\s+len=(\d+)\s+dur_ms=(\d+\.?\d*)",
            ),
            objstor_fetch_error: re(
                r"objstor:\s*FETCH_ERROR\s+key=(\S+)\s+offset=(\d+)\s+len=(\d+)\s+error=(-?\d+)",
            ),
            prefetch_queue: re(
                r"prefetch:\s*QUEUE\s+iov_idx=(\d+)\s+iov_start=0x([0-9a-fA-F]+)\s+iov_end=0x([0-9a-fA-F]+)\s+priority=(\d+)",
            ),
            prefetch_dequeue: re(r"prefetch:\s*DEQUEUE\s+iov_idx=(\d+)\s+worker=(\d+)"),
            prefetch_worker_start: re(r"prefetch:\s*WORKER_START\s+worker=(\d+)\s+iov_idx=(\d+)"),
            prefetch_worker_done: re(
                r"prefetch:\s*WORKER_DONE\s+worker=(\d+)\s+iov_idx=(\d+)\s+dur_ms=(\d+\.?\d*)",
            ),
            prefetch_worker_error: re(
                r"prefetch:\s*WORKER_ERROR\s+worker=(\d+)\s+iov_idx=(\d+)\s+error=(-?\d+)",
            ),
            prefetch_cache_hit: re(r"prefetch:\s*CACHE_HIT\s+iov_idx=(\d+)"),
            prefetch_cache_miss: re(r"prefetch:\s*CACHE_MISS\s+iov_idx=(\d+)"),
            prefetch_cache_store: re(r"prefetch:\s*CACHE_STORE\s+iov_idx=(\d+)\s+size=(\d+)"),
            prefetch_controller_fault: re(
                r"prefetch:\s*CONTROLLER_FAULT\s+iov_idx=(\d+)\s+pattern=(\d+)\s+confidence=(\d+\.?\d*)",
            ),
            prefetch_controller_promote: re(
                r"prefetch:\s*CONTROLLER_PROMOTE\s+iov_idx=(\d+)\s+old_prio=(\d+)\s+new_prio=(\d+)",
            ),
            prefetch_controller_remove: re(
                r"prefetch:\s*CONTROLLER_REMOVE\s+iov_idx=(\d+)\s+reason=(\S+)",
            ),
            prefetch_stats: re(
                r"prefetch:\s*STATS\s+requests=(\d+)\s+completed=(\d+)\s+failed=(\d+)\s+hits=(\d+)\s+misses=(\d+)",
            ),
            fault_addr: re(r"(?:0x)?([0-9a-fA-F]{4,})"),
            dump_pages: re(r"(?:Dumping|Writing)\s+(?:pages|memory).*?(\d+)"),
            restore_pages: re(r"(?:Restoring|Reading)\s+(?:pages|memory).*?(\d+)"),
        }
    }

    /// Parse one log line. Lines outside the CRIU format yield `None`.
    pub fn parse_line(&self, line: &str) -> Option<LogEvent> {
        let line = line.trim();
        let caps = self.line.captures(line)?;

        let timestamp_sec = caps.get(1)?.as_str().parse::<f64>().ok()?;
        let pid = caps.get(2)?.as_str().parse::<u32>().ok()?;
        let message = caps.get(3)?.as_str().to_owned();

        let mut event = LogEvent {
            timestamp_sec,
            pid,
            event_kind: EventKind::Info,
            message,
            details: Map::new(),
        };
        self.classify(&mut event);

        Some(event)
    }

    /// Parse a whole log file, skipping unparseable lines.
    pub fn parse_file(&self, path: &Path) -> Result<Vec<LogEvent>, failure::Error> {
        let reader = BufReader::new(std::fs::File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            if let Some(event) = self.parse_line(&line?) {
                events.push(event);
            }
        }
        Ok(events)
    }

    fn classify(&self, event: &mut LogEvent) {
        if event.message.contains("objstor:") {
            self.classify_objstor(event);
            return;
        }
        if event.message.contains("prefetch:") {
            self.classify_prefetch(event);
            return;
        }

        let message = event.message.clone();
        let msg = message.to_lowercase();

        if msg.contains("uffd") || (msg.contains("page") && msg.contains("fault")) {
            event.event_kind = EventKind::LazyFault;
            if let Some(caps) = self.fault_addr.captures(&message) {
                event
                    .details
                    .insert("address".into(), Value::from(caps[1].to_owned()));
            }
            return;
        }

        if msg.contains("dump") {
            if msg.contains("start") || msg.contains("begin") {
                event.event_kind = EventKind::DumpStart;
            } else if msg.contains("finish") || msg.contains("end") || msg.contains("complete") {
                event.event_kind = EventKind::DumpEnd;
            } else if let Some(caps) = self.dump_pages.captures(&message) {
                event.event_kind = EventKind::DumpPages;
                insert_u64(&mut event.details, "pages", &caps[1]);
            }
            return;
        }

        if msg.contains("restor") {
            if msg.contains("start") || msg.contains("begin") {
                event.event_kind = EventKind::RestoreStart;
            } else if msg.contains("finish") || msg.contains("end") || msg.contains("complete") {
                event.event_kind = EventKind::RestoreEnd;
            } else if let Some(caps) = self.restore_pages.captures(&message) {
                event.event_kind = EventKind::RestorePages;
                insert_u64(&mut event.details, "pages", &caps[1]);
            }
            return;
        }

        if msg.contains("error") || msg.contains("fail") {
            event.event_kind = EventKind::Error;
        }
    }

    fn classify_objstor(&self, event: &mut LogEvent) {
        let message = event.message.clone();

        if let Some(caps) = self.objstor_fetch_done.captures(&message) {
            event.event_kind = EventKind::ObjstorFetchDone;
            event
                .details
                .insert("key".into(), Value::from(caps[1].to_owned()));
            insert_u64(&mut event.details, "offset", &caps[2]);
            insert_u64(&mut event.details, "length", &caps[3]);
            insert_f64(&mut event.details, "duration_ms", &caps[4]);
            return;
        }

        if let Some(caps) = self.objstor_fetch_error.captures(&message) {
            event.event_kind = EventKind::ObjstorFetchError;
            event
                .details
                .insert("key".into(), Value::from(caps[1].to_owned()));
            insert_u64(&mut event.details, "offset", &caps[2]);
            insert_u64(&mut event.details, "length", &caps[3]);
            insert_i64(&mut event.details, "error_code", &caps[4]);
            return;
        }

        if let Some(caps) = self.objstor_fetch_start.captures(&message) {
            event.event_kind = EventKind::ObjstorFetchStart;
            event
                .details
                .insert("key".into(), Value::from(caps[1].to_owned()));
            insert_u64(&mut event.details, "offset", &caps[2]);
            insert_u64(&mut event.details, "length", &caps[3]);
            return;
        }

        let msg = message.to_lowercase();
        if msg.contains("error") || msg.contains("fail") {
            event.event_kind = EventKind::Error;
        }
    }

    fn classify_prefetch(&self, event: &mut LogEvent) {
        let message = event.message.clone();

        if let Some(caps) = self.prefetch_queue.captures(&message) {
            event.event_kind = EventKind::PrefetchQueue;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            event
                .details
                .insert("iov_start".into(), Value::from(caps[2].to_owned()));
            event
                .details
                .insert("iov_end".into(), Value::from(caps[3].to_owned()));
            insert_u64(&mut event.details, "priority", &caps[4]);
            return;
        }

        if let Some(caps) = self.prefetch_dequeue.captures(&message) {
            event.event_kind = EventKind::PrefetchDequeue;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            insert_u64(&mut event.details, "worker_id", &caps[2]);
            return;
        }

        if let Some(caps) = self.prefetch_worker_start.captures(&message) {
            event.event_kind = EventKind::PrefetchWorkerStart;
            insert_u64(&mut event.details, "worker_id", &caps[1]);
            insert_u64(&mut event.details, "iov_idx", &caps[2]);
            return;
        }

        if let Some(caps) = self.prefetch_worker_done.captures(&message) {
            event.event_kind = EventKind::PrefetchWorkerDone;
            insert_u64(&mut event.details, "worker_id", &caps[1]);
            insert_u64(&mut event.details, "iov_idx", &caps[2]);
            insert_f64(&mut event.details, "duration_ms", &caps[3]);
            return;
        }

        if let Some(caps) = self.prefetch_worker_error.captures(&message) {
            event.event_kind = EventKind::PrefetchWorkerError;
            insert_u64(&mut event.details, "worker_id", &caps[1]);
            insert_u64(&mut event.details, "iov_idx", &caps[2]);
            insert_i64(&mut event.details, "error_code", &caps[3]);
            return;
        }

        if let Some(caps) = self.prefetch_cache_hit.captures(&message) {
            event.event_kind = EventKind::PrefetchCacheHit;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            return;
        }

        if let Some(caps) = self.prefetch_cache_miss.captures(&message) {
            event.event_kind = EventKind::PrefetchCacheMiss;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            return;
        }

        if let Some(caps) = self.prefetch_cache_store.captures(&message) {
            event.event_kind = EventKind::PrefetchCacheStore;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            insert_u64(&mut event.details, "size", &caps[2]);
            return;
        }

        if let Some(caps) = self.prefetch_controller_fault.captures(&message) {
            event.event_kind = EventKind::PrefetchControllerFault;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            insert_u64(&mut event.details, "pattern_type", &caps[2]);
            insert_f64(&mut event.details, "confidence", &caps[3]);
            return;
        }

        if let Some(caps) = self.prefetch_controller_promote.captures(&message) {
            event.event_kind = EventKind::PrefetchControllerPromote;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            insert_u64(&mut event.details, "old_priority", &caps[2]);
            insert_u64(&mut event.details, "new_priority", &caps[3]);
            return;
        }

        if let Some(caps) = self.prefetch_controller_remove.captures(&message) {
            event.event_kind = EventKind::PrefetchControllerRemove;
            insert_u64(&mut event.details, "iov_idx", &caps[1]);
            event
                .details
                .insert("reason".into(), Value::from(caps[2].to_owned()));
            return;
        }

        if let Some(caps) = self.prefetch_stats.captures(&message) {
            event.event_kind = EventKind::PrefetchStats;
            insert_u64(&mut event.details, "total_requests", &caps[1]);
            insert_u64(&mut event.details, "completed", &caps[2]);
            insert_u64(&mut event.details, "failed", &caps[3]);
            insert_u64(&mut event.details, "cache_hits", &caps[4]);
            insert_u64(&mut event.details, "cache_misses", &caps[5]);
        }
    }
}

fn insert_u64(details: &mut Map<String, Value>, key: &str, raw: &str) {
    if let Ok(v) = raw.parse::<u64>() {
        details.insert(key.into(), Value::from(v));
    }
}

fn insert_i64(details: &mut Map<String, Value>, key: &str, raw: &str) {
    if let Ok(v) = raw.parse::<i64>() {
        details.insert(key.into(), Value::from(v));
    }
}

fn insert_f64(details: &mut Map<String, Value>, key: &str, raw: &str) {
    if let Ok(v) = raw.parse::<f64>() {
        details.insert(key.into(), Value::from(v));
    }
}

#[cfg(test)]
mod test {
    use super::{EventKind, LogParser};

    #[test]
    fn objstor_fetch_done_line() {
        let parser = LogParser::new();
        let event = parser
            .parse_line("(  0.123456) 4242 objstor: FETCH_DONE key=foo offset=0 len=4096 dur_ms=1.5")
            .unwrap();

        assert_eq!(event.event_kind, EventKind::ObjstorFetchDone);
        assert_eq!(event.event_kind.as_str(), "objstor_fetch_done");
        assert_eq!(event.pid, 4242);
        assert!((event.timestamp_sec - 0.123456).abs() < 1e-12);
        assert_eq!(event.details["key"], "foo");
        assert_eq!(event.details["offset"], 0);
        assert_eq!(event.details["length"], 4096);
        assert_eq!(event.details["duration_ms"], 1.5);
    }

    #[test]
    fn objstor_fetch_start_and_error() {
        let parser = LogParser::new();

        let start = parser
            .parse_line("( 1.000001) 7 objstor: FETCH_START key=pages-1.img offset=8192 len=4096")
            .unwrap();
        assert_eq!(start.event_kind, EventKind::ObjstorFetchStart);
        assert_eq!(start.details["offset"], 8192);

        let error = parser
            .parse_line("( 1.000002) 7 objstor: FETCH_ERROR key=pages-1.img offset=0 len=4096 error=-5")
            .unwrap();
        assert_eq!(error.event_kind, EventKind::ObjstorFetchError);
        assert_eq!(error.details["error_code"], -5);
    }

    #[test]
    fn prefetch_family() {
        let parser = LogParser::new();

        let queue = parser
            .parse_line(
                "( 2.5) 9 prefetch: QUEUE iov_idx=3 iov_start=0x7f0000 iov_end=0x7f1000 priority=1",
            )
            .unwrap();
        assert_eq!(queue.event_kind, EventKind::PrefetchQueue);
        assert_eq!(queue.details["iov_idx"], 3);
        assert_eq!(queue.details["iov_start"], "7f0000");

        let done = parser
            .parse_line("( 2.6) 9 prefetch: WORKER_DONE worker=2 iov_idx=3 dur_ms=0.75")
            .unwrap();
        assert_eq!(done.event_kind, EventKind::PrefetchWorkerDone);
        assert_eq!(done.details["duration_ms"], 0.75);

        let hit = parser
            .parse_line("( 2.7) 9 prefetch: CACHE_HIT iov_idx=3")
            .unwrap();
        assert_eq!(hit.event_kind, EventKind::PrefetchCacheHit);

        let stats = parser
            .parse_line("( 3.0) 9 prefetch: STATS requests=10 completed=9 failed=1 hits=5 misses=4")
            .unwrap();
        assert_eq!(stats.event_kind, EventKind::PrefetchStats);
        assert_eq!(stats.details["cache_misses"], 4);
    }

    #[test]
    fn fault_and_fallback_kinds() {
        let parser = LogParser::new();

        let fault = parser
            .parse_line("( 0.5) 11 uffd: handling page fault at 0x7ffdeadb000")
            .unwrap();
        assert_eq!(fault.event_kind, EventKind::LazyFault);

        let error = parser.parse_line("( 0.6) 11 Error (criu/mem.c:123): oops").unwrap();
        assert_eq!(error.event_kind, EventKind::Error);

        let info = parser.parse_line("( 0.7) 11 Running pipes stage").unwrap();
        assert_eq!(info.event_kind, EventKind::Info);

        assert!(parser.parse_line("not a criu line").is_none());
    }
}
