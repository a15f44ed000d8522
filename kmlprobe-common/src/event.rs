//! Fixed-width records handed from the probes to userspace.
//!
//! Layouts are `#[repr(C)]` with natural alignment and host byte order. Padding
//! is spelled out as `_pad` fields so a zeroed record has no uninitialised
//! bytes.

use core::fmt;

use crate::{EVENT_NAME_LEN, MAX_FILENAME_LEN, TASK_COMM_LEN};

/// Stored in `stack_hash` when no stack could be captured.
pub const STACK_HASH_UNRESOLVED: u64 = 0;

/// Encode a stack table id as a record `stack_hash`.
///
/// The stack table hands out id 0, so ids are shifted by one to keep 0 free
/// for [`STACK_HASH_UNRESOLVED`].
#[inline(always)]
pub const fn stack_hash_from_id(id: u32) -> u64 {
    id as u64 + 1
}

/// Recover the stack table key from a record `stack_hash`.
#[inline(always)]
pub const fn stack_id_from_hash(hash: u64) -> Option<u32> {
    if hash == STACK_HASH_UNRESOLVED || hash > u32::MAX as u64 + 1 {
        None
    } else {
        Some((hash - 1) as u32)
    }
}

/// Emitted by the generic call-trace probe.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallTraceEvent {
    /// Microseconds since boot.
    pub timestamp: u64,
    pub stack_hash: u64,
    /// Traced function name, NUL-terminated.
    pub event_name: [u8; EVENT_NAME_LEN],
}

impl CallTraceEvent {
    pub const fn zeroed() -> Self {
        Self {
            timestamp: 0,
            stack_hash: STACK_HASH_UNRESOLVED,
            event_name: [0; EVENT_NAME_LEN],
        }
    }
}

/// Emitted on entry to `openat(2)`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FileOpenEvent {
    pub pid: u32,
    pub tgid: u32,
    /// Microseconds since boot.
    pub timestamp: u64,
    pub filename: [u8; MAX_FILENAME_LEN],
    pub _pad: u8,
    pub flags: i32,
    pub mode: i32,
}

impl FileOpenEvent {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            tgid: 0,
            timestamp: 0,
            filename: [0; MAX_FILENAME_LEN],
            _pad: 0,
            flags: 0,
            mode: 0,
        }
    }
}

/// Emitted by the scheduler task-selection probes, one per observed phase.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SchedulerEvent {
    pub pid: u32,
    pub tgid: u32,
    /// Microseconds since boot.
    pub timestamp: u64,
    pub comm: [u8; TASK_COMM_LEN],
    pub flags: i32,
    pub mode: i32,
    /// One of [`SchedulerEventType`].
    pub event_type: u8,
    pub _pad: [u8; 7],
}

impl SchedulerEvent {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            tgid: 0,
            timestamp: 0,
            comm: [0; TASK_COMM_LEN],
            flags: 0,
            mode: 0,
            event_type: SchedulerEventType::Entry as u8,
            _pad: [0; 7],
        }
    }
}

/// Phase of the kernel's task-selection logic a scheduler record observed.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerEventType {
    Entry = 0,
    Idle = 1,
    Done = 2,
    WhileSameGroup = 3,
    WhileDiffGroups = 4,
}

impl SchedulerEventType {
    pub const ALL: [SchedulerEventType; 5] = [
        SchedulerEventType::Entry,
        SchedulerEventType::Idle,
        SchedulerEventType::Done,
        SchedulerEventType::WhileSameGroup,
        SchedulerEventType::WhileDiffGroups,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            SchedulerEventType::Entry => "entry",
            SchedulerEventType::Idle => "idle",
            SchedulerEventType::Done => "done",
            SchedulerEventType::WhileSameGroup => "while_same_group",
            SchedulerEventType::WhileDiffGroups => "while_diff_groups",
        }
    }
}

/// A scheduler record carried a tag outside the five known phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidEventType(pub u8);

impl fmt::Display for InvalidEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid scheduler event type {}", self.0)
    }
}

impl TryFrom<u8> for SchedulerEventType {
    type Error = InvalidEventType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SchedulerEventType::Entry),
            1 => Ok(SchedulerEventType::Idle),
            2 => Ok(SchedulerEventType::Done),
            3 => Ok(SchedulerEventType::WhileSameGroup),
            4 => Ok(SchedulerEventType::WhileDiffGroups),
            other => Err(InvalidEventType(other)),
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for CallTraceEvent {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for FileOpenEvent {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for SchedulerEvent {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_record_layouts() {
        assert_eq!(size_of::<CallTraceEvent>(), 48);
        assert_eq!(offset_of!(CallTraceEvent, event_name), 16);

        assert_eq!(offset_of!(FileOpenEvent, filename), 16);
        assert_eq!(offset_of!(FileOpenEvent, flags), 272);
        assert_eq!(offset_of!(FileOpenEvent, mode), 276);
        assert_eq!(size_of::<FileOpenEvent>(), 280);

        assert_eq!(offset_of!(SchedulerEvent, comm), 16);
        assert_eq!(offset_of!(SchedulerEvent, event_type), 40);
        assert_eq!(size_of::<SchedulerEvent>(), 48);
    }

    #[test]
    fn test_event_type_round_trip_and_reject() {
        for tag in SchedulerEventType::ALL {
            assert_eq!(SchedulerEventType::try_from(tag as u8), Ok(tag));
        }
        assert_eq!(SchedulerEventType::try_from(5), Err(InvalidEventType(5)));
        assert_eq!(SchedulerEventType::try_from(255), Err(InvalidEventType(255)));
    }

    #[test]
    fn test_stack_hash_never_collides_with_sentinel() {
        assert_eq!(stack_hash_from_id(0), 1);
        assert_eq!(stack_id_from_hash(1), Some(0));
        assert_eq!(stack_id_from_hash(STACK_HASH_UNRESOLVED), None);
        assert_eq!(stack_id_from_hash(stack_hash_from_id(1023)), Some(1023));
    }
}
