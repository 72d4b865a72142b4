use serde::Serialize;

/// Host facts gathered once at daemon start and attached to every connect
/// payload. Collection never fails: unavailable facts degrade to defaults.
#[derive(Debug, Clone, Serialize)]
pub struct Utilization {
    pub metadata_version: u32,
    pub logical_processors: usize,
    pub total_ram_mib: u64,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
}

/// Collects host facts from procfs, falling back to defaults where a file
/// is unreadable (containers, non-Linux test hosts).
pub fn gather() -> Utilization {
    Utilization {
        metadata_version: 5,
        logical_processors: std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1),
        total_ram_mib: read_total_ram_mib().unwrap_or(0),
        hostname: read_trimmed("/proc/sys/kernel/hostname").unwrap_or_default(),
        boot_id: read_trimmed("/proc/sys/kernel/random/boot_id"),
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses MemTotal out of /proc/meminfo, reported in MiB.
fn read_total_ram_mib() -> Option<u64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;

    for line in text.lines() {
        let Some(rest) = line.strip_prefix("MemTotal:") else {
            continue;
        };
        let kib: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
        return Some(kib / 1024);
    }

    None
}
