//! Attach-time inclusion predicate evaluated at the top of every probe.

/// Which probe family a filter slot belongs to. Used as the index into the
/// `FILTERS` array map.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeFamily {
    CallTrace = 0,
    FileOpen = 1,
    Scheduler = 2,
}

impl ProbeFamily {
    pub const COUNT: u32 = 3;

    pub const fn index(self) -> u32 {
        self as u32
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterMode {
    All = 0,
    OnlyTgid = 1,
    ExcludeTgid = 2,
}

/// Inclusion predicate written by the loader, read by the probes.
///
/// `mode` holds a raw [`FilterMode`]; values the probe does not know are
/// treated as [`FilterMode::All`].
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeFilter {
    pub mode: u32,
    pub tgid: u32,
}

impl ProbeFilter {
    pub const ALL: ProbeFilter = ProbeFilter {
        mode: FilterMode::All as u32,
        tgid: 0,
    };

    pub const fn only_tgid(tgid: u32) -> Self {
        Self {
            mode: FilterMode::OnlyTgid as u32,
            tgid,
        }
    }

    pub const fn exclude_tgid(tgid: u32) -> Self {
        Self {
            mode: FilterMode::ExcludeTgid as u32,
            tgid,
        }
    }

    /// Decide whether the task identified by `pid_tgid` (as returned by
    /// `bpf_get_current_pid_tgid`) is of interest. The idle task (pid 0) is
    /// always rejected.
    #[inline(always)]
    pub fn accepts(&self, pid_tgid: u64) -> bool {
        let pid = pid_tgid as u32;
        let tgid = (pid_tgid >> 32) as u32;

        if pid == 0 {
            return false;
        }

        if self.mode == FilterMode::OnlyTgid as u32 {
            tgid == self.tgid
        } else if self.mode == FilterMode::ExcludeTgid as u32 {
            tgid != self.tgid
        } else {
            true
        }
    }
}

impl Default for ProbeFilter {
    fn default() -> Self {
        Self::ALL
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ProbeFilter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_tgid(pid: u32, tgid: u32) -> u64 {
        ((tgid as u64) << 32) | pid as u64
    }

    #[test]
    fn test_idle_task_always_rejected() {
        for filter in [
            ProbeFilter::ALL,
            ProbeFilter::only_tgid(0),
            ProbeFilter::exclude_tgid(42),
        ] {
            assert!(!filter.accepts(pid_tgid(0, 0)));
            assert!(!filter.accepts(pid_tgid(0, 7)));
        }
    }

    #[test]
    fn test_all_accepts_any_task() {
        assert!(ProbeFilter::ALL.accepts(pid_tgid(1, 1)));
        assert!(ProbeFilter::ALL.accepts(pid_tgid(4242, 4200)));
    }

    #[test]
    fn test_only_tgid() {
        let filter = ProbeFilter::only_tgid(100);
        assert!(filter.accepts(pid_tgid(101, 100)));
        assert!(!filter.accepts(pid_tgid(200, 200)));
    }

    #[test]
    fn test_exclude_tgid() {
        let filter = ProbeFilter::exclude_tgid(100);
        assert!(!filter.accepts(pid_tgid(100, 100)));
        assert!(filter.accepts(pid_tgid(200, 200)));
    }

    #[test]
    fn test_unknown_mode_behaves_as_all() {
        let filter = ProbeFilter { mode: 99, tgid: 5 };
        assert!(filter.accepts(pid_tgid(9, 9)));
        assert!(!filter.accepts(pid_tgid(0, 9)));
    }
}
