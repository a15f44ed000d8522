//! Kernel symbol addresses from `/proc/kallsyms`.
//!
//! Used to key function names by the address a kprobe reports, so the
//! call-trace probe can label records without string work in the kernel.

use std::collections::HashMap;

use anyhow::{Context, Result};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

#[derive(Debug, Default)]
pub struct Kallsyms {
    text: HashMap<String, u64>,
}

impl Kallsyms {
    pub fn load() -> Result<Self> {
        let raw = std::fs::read_to_string(KALLSYMS_PATH)
            .with_context(|| format!("Failed to read {}", KALLSYMS_PATH))?;
        Ok(Self::parse(&raw))
    }

    /// Keeps the first text (`t`/`T`) symbol seen for each name. Lines that do
    /// not parse are skipped.
    pub fn parse(raw: &str) -> Self {
        let mut text = HashMap::new();
        for line in raw.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !matches!(kind, "t" | "T") {
                continue;
            }
            let Ok(addr) = u64::from_str_radix(addr, 16) else {
                continue;
            };
            text.entry(name.to_string()).or_insert(addr);
        }
        Self { text }
    }

    /// Address of `name`, or `None` if unknown or hidden (reads as zero
    /// without privileges).
    pub fn address(&self, name: &str) -> Option<u64> {
        self.text.get(name).copied().filter(|addr| *addr != 0)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.text.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ffffffff81000000 T _stext
ffffffff812a4f30 T vfs_read
ffffffff8110a2c0 t pick_next_task_fair
ffffffff82a00000 D jiffies
ffffffffc0a1b010 t ext4_file_read_iter\t[ext4]
ffffffff8110a2c0 t pick_next_task_fair
ffffffff89999999 t pick_next_task_fair
not-a-line
zzzz T broken_addr
";

    #[test]
    fn test_parse_text_symbols() {
        let syms = Kallsyms::parse(SAMPLE);
        assert_eq!(syms.address("vfs_read"), Some(0xffffffff812a4f30));
        assert_eq!(syms.address("ext4_file_read_iter"), Some(0xffffffffc0a1b010));
        assert_eq!(syms.address("jiffies"), None);
        assert_eq!(syms.address("broken_addr"), None);
        assert_eq!(syms.len(), 4);
    }

    #[test]
    fn test_first_duplicate_wins() {
        let syms = Kallsyms::parse(SAMPLE);
        assert_eq!(syms.address("pick_next_task_fair"), Some(0xffffffff8110a2c0));
    }

    #[test]
    fn test_hidden_addresses() {
        let syms = Kallsyms::parse("0000000000000000 T vfs_read\n");
        assert!(!syms.is_empty());
        assert_eq!(syms.address("vfs_read"), None);
    }
}
