use std::path::Path;

use anyhow::{Context, Result, bail};
use config::{Config, ConfigError, Environment, File};
use kmlprobe_common::ProbeFilter;
use serde::Deserialize;

use crate::output::OutputFormat;
use crate::probes::KprobeSite;

const DEFAULT_COUNTER_INTERVAL_SECONDS: u64 = 5;

/// Kernel functions traced by the call-trace probe when none are configured.
pub const DEFAULT_TRACED_FUNCTIONS: &[&str] = &[
    "pick_next_task",
    "enqueue_task_fair",
    "pick_next_task_fair",
    "check_preempt_wakeup",
    "schedule",
    "vfs_read",
    "filemap_read",
    "ext4_file_read_iter",
    "write_cache_pages",
    "submit_bh_wbc",
    "__alloc_pages",
    "mempool_alloc",
    "swap_readpage",
    "filemap_fault",
    "blk_mq_start_request",
    "blk_mq_dispatch_rq_list",
    "blk_bio_list_merge",
    "nvme_queue_rq",
    "blk_stat_add",
];

/// Entry site of the scheduler probe when none is configured. The other phases
/// sit at build-specific offsets and have no default.
pub const DEFAULT_SCHEDULER_ENTRY: &str = "pick_next_task_fair";

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterModeSetting {
    #[default]
    All,
    OnlyTgid,
    ExcludeTgid,
}

/// Inclusion predicate as configured. Resolved into a [`ProbeFilter`] at
/// attach time.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct FilterSettings {
    pub mode: Option<FilterModeSetting>,
    pub tgid: Option<u32>,
    /// Resolved to a tgid through procfs when `tgid` is not set.
    pub process_name: Option<String>,
}

impl FilterSettings {
    pub fn resolve(&self) -> Result<ProbeFilter> {
        match self.mode.unwrap_or_default() {
            FilterModeSetting::All => Ok(ProbeFilter::ALL),
            FilterModeSetting::OnlyTgid => match self.target_tgid()? {
                Some(tgid) => Ok(ProbeFilter::only_tgid(tgid)),
                None => bail!("filter mode only_tgid needs a tgid or process_name"),
            },
            // Without a target, keep our own reads of the perf buffers out of the stream.
            FilterModeSetting::ExcludeTgid => Ok(ProbeFilter::exclude_tgid(
                self.target_tgid()?.unwrap_or_else(std::process::id),
            )),
        }
    }

    fn target_tgid(&self) -> Result<Option<u32>> {
        if let Some(tgid) = self.tgid {
            return Ok(Some(tgid));
        }
        match &self.process_name {
            Some(name) => find_tgid_by_name(name)
                .map(Some)
                .with_context(|| format!("No running process named {}", name)),
            None => Ok(None),
        }
    }
}

fn find_tgid_by_name(name: &str) -> Result<u32> {
    let processes = procfs::process::all_processes().context("Failed to list processes")?;
    for process in processes.flatten() {
        if let Ok(stat) = process.stat() {
            if stat.comm == name {
                return Ok(process.pid() as u32);
            }
        }
    }
    bail!("process {} not found", name)
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct CallTraceSettings {
    pub enabled: Option<bool>,
    pub functions: Option<Vec<String>>,
    pub filter: Option<FilterSettings>,
}

impl CallTraceSettings {
    pub fn sites(&self) -> Result<Vec<KprobeSite>> {
        match &self.functions {
            Some(functions) => functions.iter().map(|f| f.parse()).collect(),
            None => DEFAULT_TRACED_FUNCTIONS.iter().map(|f| f.parse()).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct FileOpenSettings {
    pub enabled: Option<bool>,
    pub counter_interval_secs: Option<u64>,
    pub filter: Option<FilterSettings>,
}

impl FileOpenSettings {
    pub fn counter_interval_secs(&self) -> u64 {
        self.counter_interval_secs
            .unwrap_or(DEFAULT_COUNTER_INTERVAL_SECONDS)
            .max(1)
    }
}

/// Attach sites of the five task-selection phases, as `symbol[+offset]`.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct SchedulerSettings {
    pub enabled: Option<bool>,
    pub entry: Option<String>,
    pub idle: Option<String>,
    pub done: Option<String>,
    pub while_same_group: Option<String>,
    pub while_diff_groups: Option<String>,
    pub filter: Option<FilterSettings>,
}

impl SchedulerSettings {
    /// `(program name, site)` for every phase, `None` where no site is set.
    pub fn sites(&self) -> Result<Vec<(&'static str, Option<KprobeSite>)>> {
        let entry = self
            .entry
            .as_deref()
            .unwrap_or(DEFAULT_SCHEDULER_ENTRY);
        let phases = [
            ("pick_entry", Some(entry)),
            ("pick_idle", self.idle.as_deref()),
            ("pick_done", self.done.as_deref()),
            ("pick_while_same_group", self.while_same_group.as_deref()),
            ("pick_while_diff_groups", self.while_diff_groups.as_deref()),
        ];

        let mut sites = Vec::with_capacity(phases.len());
        for (program, site) in phases {
            let site = match site {
                Some(site) => Some(site.parse::<KprobeSite>()?),
                None => None,
            };
            sites.push((program, site));
        }
        Ok(sites)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Probes {
    #[serde(default)]
    pub call_trace: CallTraceSettings,
    #[serde(default)]
    pub file_open: FileOpenSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct OutputSettings {
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub probes: Probes,
    /// Applies to every probe family without its own `filter`.
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

impl Settings {
    /// Environment variables override values from the optional YAML file.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }

        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("probes.call_trace.functions")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output.format.unwrap_or_default()
    }

    fn family_filter(&self, own: &Option<FilterSettings>) -> Result<ProbeFilter> {
        own.as_ref().unwrap_or(&self.filter).resolve()
    }

    pub fn call_trace_filter(&self) -> Result<ProbeFilter> {
        self.family_filter(&self.probes.call_trace.filter)
    }

    pub fn file_open_filter(&self) -> Result<ProbeFilter> {
        self.family_filter(&self.probes.file_open.filter)
    }

    pub fn scheduler_filter(&self) -> Result<ProbeFilter> {
        self.family_filter(&self.probes.scheduler.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_settings() {
        unsafe {
            std::env::set_var("PROBES__FILE_OPEN__ENABLED", "true");
            std::env::set_var("PROBES__FILE_OPEN__COUNTER_INTERVAL_SECS", "42");
            std::env::set_var("PROBES__CALL_TRACE__FUNCTIONS", "vfs_read,schedule+0x10");
            std::env::set_var("PROBES__SCHEDULER__DONE", "__schedule+0x5cf");
            std::env::set_var("FILTER__MODE", "only_tgid");
            std::env::set_var("FILTER__TGID", "4242");
            std::env::set_var("OUTPUT__FORMAT", "json");
        }

        let settings = Settings::load(None).expect("Failed to load settings");

        assert_eq!(settings.probes.file_open.enabled, Some(true));
        assert_eq!(settings.probes.file_open.counter_interval_secs(), 42);
        assert_eq!(
            settings.probes.call_trace.functions,
            Some(vec!["vfs_read".to_string(), "schedule+0x10".to_string()])
        );
        assert_eq!(
            settings.probes.scheduler.done.as_deref(),
            Some("__schedule+0x5cf")
        );
        assert_eq!(settings.filter.mode, Some(FilterModeSetting::OnlyTgid));
        assert_eq!(settings.output_format(), OutputFormat::Json);
        assert_eq!(
            settings.scheduler_filter().unwrap(),
            ProbeFilter::only_tgid(4242)
        );

        unsafe {
            std::env::remove_var("PROBES__FILE_OPEN__ENABLED");
            std::env::remove_var("PROBES__FILE_OPEN__COUNTER_INTERVAL_SECS");
            std::env::remove_var("PROBES__CALL_TRACE__FUNCTIONS");
            std::env::remove_var("PROBES__SCHEDULER__DONE");
            std::env::remove_var("FILTER__MODE");
            std::env::remove_var("FILTER__TGID");
            std::env::remove_var("OUTPUT__FORMAT");
        }
    }

    #[test]
    fn test_default_sites() {
        let settings = Settings::default();

        let sites = settings.probes.call_trace.sites().unwrap();
        assert_eq!(sites.len(), DEFAULT_TRACED_FUNCTIONS.len());
        assert!(sites.iter().all(|s| s.offset == 0));

        let phases = settings.probes.scheduler.sites().unwrap();
        assert_eq!(phases.len(), 5);
        assert_eq!(phases[0].0, "pick_entry");
        assert_eq!(
            phases[0].1.as_ref().map(|s| s.symbol.as_str()),
            Some(DEFAULT_SCHEDULER_ENTRY)
        );
        assert!(phases[1..].iter().all(|(_, site)| site.is_none()));
    }

    #[test]
    fn test_invalid_site_is_rejected() {
        let settings = CallTraceSettings {
            functions: Some(vec!["vfs_read+zz".to_string()]),
            ..Default::default()
        };
        assert!(settings.sites().is_err());
    }

    #[test]
    fn test_filter_resolution() {
        let all = FilterSettings::default();
        assert_eq!(all.resolve().unwrap(), ProbeFilter::ALL);

        let only = FilterSettings {
            mode: Some(FilterModeSetting::OnlyTgid),
            tgid: Some(7),
            process_name: None,
        };
        assert_eq!(only.resolve().unwrap(), ProbeFilter::only_tgid(7));

        let missing = FilterSettings {
            mode: Some(FilterModeSetting::OnlyTgid),
            ..Default::default()
        };
        assert!(missing.resolve().is_err());

        let exclude_self = FilterSettings {
            mode: Some(FilterModeSetting::ExcludeTgid),
            ..Default::default()
        };
        assert_eq!(
            exclude_self.resolve().unwrap(),
            ProbeFilter::exclude_tgid(std::process::id())
        );
    }

    #[test]
    fn test_family_filter_overrides_global() {
        let settings = Settings {
            filter: FilterSettings {
                mode: Some(FilterModeSetting::ExcludeTgid),
                tgid: Some(1),
                process_name: None,
            },
            probes: Probes {
                file_open: FileOpenSettings {
                    filter: Some(FilterSettings::default()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(settings.file_open_filter().unwrap(), ProbeFilter::ALL);
        assert_eq!(
            settings.call_trace_filter().unwrap(),
            ProbeFilter::exclude_tgid(1)
        );
    }
}
