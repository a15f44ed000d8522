#![cfg_attr(not(test), no_std)]

//! Types and probe logic shared between the eBPF object and userspace.
//!
//! Everything in here must stay usable from the eBPF target: no allocation,
//! no panicking paths on the probe side, fixed-size `#[repr(C)]` records.

pub mod event;
pub mod filter;
pub mod probe;

pub use event::{
    CallTraceEvent, FileOpenEvent, InvalidEventType, STACK_HASH_UNRESOLVED, SchedulerEvent,
    SchedulerEventType, stack_hash_from_id, stack_id_from_hash,
};
pub use filter::{FilterMode, ProbeFamily, ProbeFilter};

/// `TASK_COMM_LEN` in the kernel.
pub const TASK_COMM_LEN: usize = 16;

/// Longest single path component (`NAME_MAX`).
pub const MAX_FILENAME_LEN: usize = 255;

/// Capacity of the traced function name carried by call-trace records.
pub const EVENT_NAME_LEN: usize = 32;

/// Number of distinct stacks the stack table can hold for a session.
pub const STACK_TABLE_CAPACITY: u32 = 1024;

/// Key of the single slot in the invocation counter map.
pub const COUNTER_KEY: u64 = 0;

/// Down-scale a monotonic nanosecond reading to microseconds (truncating).
#[inline(always)]
pub const fn ns_to_us(ns: u64) -> u64 {
    ns / 1000
}

/// Copy `src` into `dst`, truncating so that the result is always
/// NUL-terminated inside `dst`. Copying stops at the first NUL in `src`.
///
/// Returns the number of bytes copied, excluding the terminator.
#[inline(always)]
pub fn copy_bounded(dst: &mut [u8], src: &[u8]) -> usize {
    if dst.is_empty() {
        return 0;
    }
    let limit = dst.len() - 1;
    let mut i = 0;
    while i < limit && i < src.len() && src[i] != 0 {
        dst[i] = src[i];
        i += 1;
    }
    dst[i] = 0;
    i
}

/// The bytes of a NUL-terminated buffer up to (not including) the first NUL.
#[inline(always)]
pub fn c_str(buf: &[u8]) -> &[u8] {
    let mut end = 0;
    while end < buf.len() && buf[end] != 0 {
        end += 1;
    }
    &buf[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ns_to_us_truncates() {
        assert_eq!(ns_to_us(0), 0);
        assert_eq!(ns_to_us(999), 0);
        assert_eq!(ns_to_us(1_999), 1);
        assert_eq!(ns_to_us(5_000_000), 5_000);
    }

    #[test]
    fn test_copy_bounded_fits() {
        let mut dst = [0xffu8; 8];
        let n = copy_bounded(&mut dst, b"abc");
        assert_eq!(n, 3);
        assert_eq!(&dst[..4], b"abc\0");
    }

    #[test]
    fn test_copy_bounded_truncates_and_terminates() {
        let mut dst = [0xffu8; 4];
        let n = copy_bounded(&mut dst, b"abcdefgh");
        assert_eq!(n, 3);
        assert_eq!(&dst, b"abc\0");
    }

    #[test]
    fn test_copy_bounded_stops_at_nul() {
        let mut dst = [0u8; 8];
        let n = copy_bounded(&mut dst, b"ab\0cd");
        assert_eq!(n, 2);
        assert_eq!(c_str(&dst), b"ab");
    }

    #[test]
    fn test_copy_bounded_empty_destination() {
        let mut dst: [u8; 0] = [];
        assert_eq!(copy_bounded(&mut dst, b"abc"), 0);
    }

    #[test]
    fn test_c_str_without_terminator() {
        assert_eq!(c_str(b"full"), b"full");
        assert_eq!(c_str(b"\0rest"), b"");
    }
}
