//! Decoding of raw probe records and their rendering for the operator.
//!
//! Field names follow the column names downstream collection tables use
//! (`ts_uptime_us`, `event_name`, ...), so JSON lines can be loaded as-is.

use std::fmt;

use clap::ValueEnum;
use kmlprobe_common::{
    CallTraceEvent, FileOpenEvent, InvalidEventType, SchedulerEvent, SchedulerEventType, c_str,
    stack_id_from_hash,
};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One `info` log line per record.
    #[default]
    Log,
    /// One JSON object per line on stdout.
    Json,
}

impl OutputFormat {
    pub fn write<R: Serialize + fmt::Display>(self, record: &R) {
        match self {
            OutputFormat::Log => info!("{}", record),
            OutputFormat::Json => match serde_json::to_string(record) {
                Ok(line) => println!("{}", line),
                Err(e) => log::warn!("Failed to serialize record: {}", e),
            },
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(c_str(bytes)).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallTraceRecord {
    pub cpu: u32,
    pub timestamp: u64,
    pub function: String,
    /// 0 when no stack was captured.
    pub stack_hash: u64,
}

impl CallTraceRecord {
    pub fn decode(cpu: u32, event: &CallTraceEvent) -> Self {
        Self {
            cpu,
            timestamp: event.timestamp,
            function: lossy(&event.event_name),
            stack_hash: event.stack_hash,
        }
    }

    /// Key of the captured stack in the `STACK_TRACES` map.
    pub fn stack_id(&self) -> Option<u32> {
        stack_id_from_hash(self.stack_hash)
    }
}

impl fmt::Display for CallTraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = if self.function.is_empty() {
            "<unknown>"
        } else {
            &self.function
        };
        write!(
            f,
            "CALL_TRACE cpu={} ts={}us fn={} stack=",
            self.cpu, self.timestamp, function
        )?;
        match self.stack_id() {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOpenRecord {
    pub cpu: u32,
    pub pid: u32,
    pub tgid: u32,
    pub ts_uptime_us: u64,
    pub filename: String,
    pub flags: i32,
    pub mode: i32,
}

impl FileOpenRecord {
    pub fn decode(cpu: u32, event: &FileOpenEvent) -> Self {
        Self {
            cpu,
            pid: event.pid,
            tgid: event.tgid,
            ts_uptime_us: event.timestamp,
            filename: lossy(&event.filename),
            flags: event.flags,
            mode: event.mode,
        }
    }
}

impl fmt::Display for FileOpenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FILE_OPEN cpu={} pid={} tgid={} ts={}us file={} flags={} mode={:o}",
            self.cpu,
            self.pid,
            self.tgid,
            self.ts_uptime_us,
            self.filename,
            format_open_flags(self.flags),
            self.mode,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerRecord {
    pub cpu: u32,
    pub pid: u32,
    pub tgid: u32,
    pub ts_uptime_us: u64,
    pub comm: String,
    pub flags: i32,
    pub mode: i32,
    pub event_name: &'static str,
}

impl SchedulerRecord {
    pub fn decode(cpu: u32, event: &SchedulerEvent) -> Result<Self, InvalidEventType> {
        let event_type = SchedulerEventType::try_from(event.event_type)?;
        Ok(Self {
            cpu,
            pid: event.pid,
            tgid: event.tgid,
            ts_uptime_us: event.timestamp,
            comm: lossy(&event.comm),
            flags: event.flags,
            mode: event.mode,
            event_name: event_type.as_str(),
        })
    }
}

impl fmt::Display for SchedulerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SCHED_PICK cpu={} pid={} tgid={} comm={} ts={}us phase={}",
            self.cpu, self.pid, self.tgid, self.comm, self.ts_uptime_us, self.event_name,
        )
    }
}

pub fn format_open_flags(flags: i32) -> String {
    let mut parts = Vec::new();

    // Access mode
    match flags & 0b11 {
        0 => parts.push("O_RDONLY"),
        1 => parts.push("O_WRONLY"),
        2 => parts.push("O_RDWR"),
        _ => {}
    }

    if flags & libc::O_CREAT != 0 {
        parts.push("O_CREAT");
    }
    if flags & libc::O_TRUNC != 0 {
        parts.push("O_TRUNC");
    }
    if flags & libc::O_APPEND != 0 {
        parts.push("O_APPEND");
    }
    if flags & libc::O_DIRECTORY != 0 {
        parts.push("O_DIRECTORY");
    }
    if flags & libc::O_CLOEXEC != 0 {
        parts.push("O_CLOEXEC");
    }

    parts.join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmlprobe_common::{MAX_FILENAME_LEN, STACK_HASH_UNRESOLVED, copy_bounded};

    #[test]
    fn test_decode_file_open() {
        let mut event = FileOpenEvent::zeroed();
        event.pid = 4321;
        event.tgid = 4300;
        event.timestamp = 1_000_000;
        copy_bounded(&mut event.filename, b"/etc/passwd");

        let record = FileOpenRecord::decode(3, &event);
        assert_eq!(record.filename, "/etc/passwd");
        assert_eq!(record.pid, 4321);
        assert_eq!(record.tgid, 4300);
        assert_eq!(record.flags, 0);
        assert_eq!(record.mode, 0);
        assert_eq!(record.cpu, 3);
    }

    #[test]
    fn test_decode_file_open_full_width_name() {
        let mut event = FileOpenEvent::zeroed();
        event.filename = [b'x'; MAX_FILENAME_LEN];
        let record = FileOpenRecord::decode(0, &event);
        assert_eq!(record.filename.len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn test_decode_scheduler_rejects_unknown_tag() {
        let mut event = SchedulerEvent::zeroed();
        event.event_type = 9;
        assert_eq!(
            SchedulerRecord::decode(0, &event),
            Err(InvalidEventType(9))
        );
    }

    #[test]
    fn test_decode_scheduler() {
        let mut event = SchedulerEvent::zeroed();
        event.pid = 12;
        event.tgid = 10;
        event.event_type = SchedulerEventType::WhileDiffGroups as u8;
        copy_bounded(&mut event.comm, b"kworker/0:1");

        let record = SchedulerRecord::decode(1, &event).unwrap();
        assert_eq!(record.comm, "kworker/0:1");
        assert_eq!(record.event_name, "while_diff_groups");
    }

    #[test]
    fn test_call_trace_stack_id() {
        let mut event = CallTraceEvent::zeroed();
        copy_bounded(&mut event.event_name, b"vfs_read");
        event.stack_hash = 8;

        let record = CallTraceRecord::decode(0, &event);
        assert_eq!(record.function, "vfs_read");
        assert_eq!(record.stack_id(), Some(7));
        assert!(record.to_string().ends_with("stack=7"));

        event.stack_hash = STACK_HASH_UNRESOLVED;
        let record = CallTraceRecord::decode(0, &event);
        assert_eq!(record.stack_id(), None);
        assert!(record.to_string().ends_with("stack=-"));
    }

    #[test]
    fn test_json_columns() {
        let mut event = SchedulerEvent::zeroed();
        event.pid = 1;
        event.tgid = 1;
        event.timestamp = 55;
        copy_bounded(&mut event.comm, b"init");

        let record = SchedulerRecord::decode(2, &event).unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["ts_uptime_us"], 55);
        assert_eq!(value["comm"], "init");
        assert_eq!(value["event_name"], "entry");
        assert_eq!(value["cpu"], 2);
    }

    #[test]
    fn test_format_open_flags() {
        assert_eq!(format_open_flags(0), "O_RDONLY");
        assert_eq!(
            format_open_flags(libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC),
            "O_WRONLY|O_CREAT|O_TRUNC"
        );
        assert_eq!(format_open_flags(libc::O_RDWR | libc::O_APPEND), "O_RDWR|O_APPEND");
    }
}
