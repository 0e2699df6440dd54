//! Device utilization sampling from `/proc/diskstats`.
//!
//! %util is computed the same way the classic I/O tools do: the delta of a
//! device's busy-time counter across two samples, divided by the wall-clock
//! interval. A read or parse failure yields "unknown" and the caller falls
//! back to conservative scaling rules.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

const DISKSTATS: &str = "/proc/diskstats";
/// Busy-time field (milliseconds spent doing I/O), counted after
/// major/minor/name.
const IO_TICKS_FIELD: usize = 9;

#[derive(Debug, Error)]
pub enum DiskIoError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("device `{device}` not present in diskstats")]
    UnknownDevice { device: String },
}

/// Utilization of the sampled device, bucketed for scaling decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct DiskPressure {
    pub device: String,
    pub percent: f32,
}

impl DiskPressure {
    pub fn saturated(&self) -> bool {
        self.percent >= 90.0
    }

    pub fn idle(&self) -> bool {
        self.percent < 50.0
    }
}

/// Two-sample %util measurement.
pub async fn sample_utilization(
    device: &str,
    interval: Duration,
) -> Result<DiskPressure, DiskIoError> {
    let before = read_io_ticks(Path::new(DISKSTATS))?;
    tokio::time::sleep(interval).await;
    let after = read_io_ticks(Path::new(DISKSTATS))?;

    let start = before
        .get(device)
        .copied()
        .ok_or_else(|| DiskIoError::UnknownDevice {
            device: device.to_string(),
        })?;
    let end = after
        .get(device)
        .copied()
        .ok_or_else(|| DiskIoError::UnknownDevice {
            device: device.to_string(),
        })?;

    let percent = utilization_percent(start, end, interval);
    debug!(device, percent, "disk utilization sampled");
    Ok(DiskPressure {
        device: device.to_string(),
        percent,
    })
}

/// The device with the most cumulative busy time; used when no device is
/// configured. Partitions (trailing digits on sd/vd/hd names) are skipped in
/// favor of whole devices.
pub fn busiest_device() -> Option<String> {
    let ticks = read_io_ticks(Path::new(DISKSTATS)).ok()?;
    ticks
        .into_iter()
        .filter(|(name, _)| !is_partition(name))
        .max_by_key(|(_, ticks)| *ticks)
        .map(|(name, _)| name)
}

fn is_partition(name: &str) -> bool {
    let base_with_digit = (name.starts_with("sd") || name.starts_with("vd") || name.starts_with("hd"))
        && name.chars().last().is_some_and(|c| c.is_ascii_digit());
    let nvme_partition = name.contains('p')
        && name.starts_with("nvme")
        && name.chars().last().is_some_and(|c| c.is_ascii_digit());
    base_with_digit || nvme_partition
}

fn utilization_percent(start_ticks: u64, end_ticks: u64, interval: Duration) -> f32 {
    let interval_ms = interval.as_millis().max(1) as f32;
    let busy_ms = end_ticks.saturating_sub(start_ticks) as f32;
    (busy_ms / interval_ms * 100.0).clamp(0.0, 100.0)
}

fn read_io_ticks(path: &Path) -> Result<HashMap<String, u64>, DiskIoError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DiskIoError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_diskstats(&raw))
}

fn parse_diskstats(raw: &str) -> HashMap<String, u64> {
    let mut ticks = HashMap::new();
    for line in raw.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // major minor name + stat fields
        if fields.len() < 3 + IO_TICKS_FIELD + 1 {
            continue;
        }
        let name = fields[2];
        if let Ok(value) = fields[3 + IO_TICKS_FIELD].parse::<u64>() {
            ticks.insert(name.to_string(), value);
        }
    }
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
   8       0 sda 1200 30 45000 900 800 40 30000 700 0 1500 1600 0 0 0 0 0 0
   8       1 sda1 1100 30 44000 880 790 40 29000 690 0 1400 1570 0 0 0 0 0 0
 259       0 nvme0n1 5000 10 90000 2000 4000 5 80000 1500 2 6000 3500 0 0 0 0 0 0
";

    #[test]
    fn diskstats_lines_parse_io_ticks() {
        let ticks = parse_diskstats(SAMPLE);
        assert_eq!(ticks.get("sda"), Some(&1500));
        assert_eq!(ticks.get("nvme0n1"), Some(&6000));
    }

    #[test]
    fn short_lines_are_skipped() {
        let ticks = parse_diskstats("8 0 sda 12 3\n");
        assert!(ticks.is_empty());
    }

    #[test]
    fn utilization_is_busy_fraction_of_interval() {
        let percent = utilization_percent(1_000, 1_900, Duration::from_secs(1));
        assert!((percent - 90.0).abs() < 0.01);

        // Counter wrap or reset never reports negative.
        assert_eq!(utilization_percent(2_000, 1_000, Duration::from_secs(1)), 0.0);

        // Busier than wall clock (multi-queue devices) is clamped.
        assert_eq!(
            utilization_percent(0, 10_000, Duration::from_secs(1)),
            100.0
        );
    }

    #[test]
    fn pressure_buckets_match_scaling_thresholds() {
        let saturated = DiskPressure {
            device: "sda".to_string(),
            percent: 94.0,
        };
        assert!(saturated.saturated());
        assert!(!saturated.idle());

        let idle = DiskPressure {
            device: "sda".to_string(),
            percent: 42.0,
        };
        assert!(!idle.saturated());
        assert!(idle.idle());

        let middling = DiskPressure {
            device: "sda".to_string(),
            percent: 78.0,
        };
        assert!(!middling.saturated());
        assert!(!middling.idle());
    }

    #[test]
    fn partitions_are_not_whole_devices() {
        assert!(is_partition("sda1"));
        assert!(is_partition("nvme0n1p2"));
        assert!(!is_partition("sda"));
        assert!(!is_partition("nvme0n1"));
    }
}
