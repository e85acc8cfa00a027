//! Remote probes and their parsers
//!
//! Host metrics come from one exec per cycle that dumps the relevant
//! `/proc` files between `===SECTION===` markers. CPU% and network rates
//! need two samples, so the first sample of a host reports them as absent.
//!
//! Container metrics come from `docker stats --no-stream` in JSON-lines
//! format.

use serde::Deserialize;
use tracing::debug;

use super::types::MetricSet;

/// Keep the probe small: first line of /proc/stat, two meminfo fields
pub const HOST_PROBE_COMMAND: &str = "echo '===STAT==='; head -1 /proc/stat 2>/dev/null; \
echo '===MEMINFO==='; grep -E '^(MemTotal|MemAvailable):' /proc/meminfo 2>/dev/null; \
echo '===LOADAVG==='; cat /proc/loadavg 2>/dev/null; \
echo '===NETDEV==='; cat /proc/net/dev 2>/dev/null; \
echo '===UPTIME==='; cat /proc/uptime 2>/dev/null; \
echo '===DISK==='; df -P / 2>/dev/null; \
echo '===END==='";

pub const CONTAINER_PROBE_COMMAND: &str = "docker stats --no-stream --format '{{json .}}'";

/// Raw CPU counters from /proc/stat
#[derive(Debug, Clone, Default)]
pub struct CpuSnapshot {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
}

impl CpuSnapshot {
    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    fn active(&self) -> u64 {
        self.total() - self.idle - self.iowait
    }
}

/// Raw network counters from /proc/net/dev
#[derive(Debug, Clone, Default)]
pub struct NetSnapshot {
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Counters kept between polls of one host
#[derive(Debug, Clone)]
pub struct PreviousSample {
    cpu: Option<CpuSnapshot>,
    net: Option<NetSnapshot>,
    timestamp_ms: u64,
}

/// Parse the host probe output. Returns the metrics and the counters to
/// keep for the next delta.
pub fn parse_host_metrics(
    output: &str,
    prev: Option<&PreviousSample>,
    now_ms: u64,
) -> (MetricSet, PreviousSample) {
    let cpu_snap = parse_cpu_snapshot(output);
    let net_snap = parse_net_snapshot(output);
    let mem = parse_meminfo(output);
    let load = parse_loadavg(output);

    let cpu_percent = match (&cpu_snap, prev.and_then(|p| p.cpu.as_ref())) {
        (Some(curr), Some(prev_cpu)) => {
            let total_delta = curr.total().saturating_sub(prev_cpu.total());
            let active_delta = curr.active().saturating_sub(prev_cpu.active());
            if total_delta > 0 {
                Some((active_delta as f64 / total_delta as f64) * 100.0)
            } else {
                None
            }
        }
        _ => None,
    };

    let (net_rx_rate, net_tx_rate) = match (&net_snap, prev) {
        (Some(curr), Some(prev_s)) => match prev_s.net.as_ref() {
            Some(prev_net) if now_ms > prev_s.timestamp_ms => {
                let elapsed_secs = (now_ms - prev_s.timestamp_ms) as f64 / 1000.0;
                let rx = (curr.rx_bytes.saturating_sub(prev_net.rx_bytes)) as f64 / elapsed_secs;
                let tx = (curr.tx_bytes.saturating_sub(prev_net.tx_bytes)) as f64 / elapsed_secs;
                (Some(rx as u64), Some(tx as u64))
            }
            _ => (None, None),
        },
        _ => (None, None),
    };

    let (memory_used, memory_total, memory_percent) = match mem {
        Some((used, total)) => {
            let pct = (total > 0).then(|| (used as f64 / total as f64) * 100.0);
            (Some(used), Some(total), pct)
        }
        None => (None, None, None),
    };

    let metrics = MetricSet {
        cpu_percent,
        memory_percent,
        memory_used,
        memory_total,
        disk_percent: parse_disk_percent(output),
        net_rx_bytes_per_sec: net_rx_rate,
        net_tx_bytes_per_sec: net_tx_rate,
        net_rx_bytes: net_snap.as_ref().map(|n| n.rx_bytes),
        net_tx_bytes: net_snap.as_ref().map(|n| n.tx_bytes),
        load_avg_1: load.map(|(a, _, _)| a),
        load_avg_5: load.map(|(_, b, _)| b),
        load_avg_15: load.map(|(_, _, c)| c),
        uptime_secs: parse_uptime(output),
    };

    let sample = PreviousSample {
        cpu: cpu_snap,
        net: net_snap,
        timestamp_ms: now_ms,
    };
    (metrics, sample)
}

// ─── Host parsers ─────────────────────────────────────────────────────────

/// Extract section between markers
fn extract_section<'a>(output: &'a str, marker: &str) -> Option<&'a str> {
    let start_marker = format!("==={}===", marker);
    let start = output.find(&start_marker)?;
    let rest = &output[start + start_marker.len()..];
    let end = rest.find("===").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

/// Parse /proc/stat first line
fn parse_cpu_snapshot(output: &str) -> Option<CpuSnapshot> {
    let section = extract_section(output, "STAT")?;
    let line = section.lines().next()?;
    if !line.starts_with("cpu ") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 9 {
        return None;
    }
    Some(CpuSnapshot {
        user: parts[1].parse().ok()?,
        nice: parts[2].parse().ok()?,
        system: parts[3].parse().ok()?,
        idle: parts[4].parse().ok()?,
        iowait: parts[5].parse().ok()?,
        irq: parts[6].parse().ok()?,
        softirq: parts[7].parse().ok()?,
        steal: parts[8].parse().ok()?,
    })
}

/// Parse /proc/meminfo into (used_bytes, total_bytes)
fn parse_meminfo(output: &str) -> Option<(u64, u64)> {
    let section = extract_section(output, "MEMINFO")?;
    let mut total_kb: Option<u64> = None;
    let mut available_kb: Option<u64> = None;

    for line in section.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = extract_kb_value(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = extract_kb_value(line);
        }
    }

    let total = total_kb? * 1024;
    let available = available_kb? * 1024;
    Some((total.saturating_sub(available), total))
}

/// "MemTotal:    1234 kB" -> 1234
fn extract_kb_value(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse().ok()
}

fn parse_loadavg(output: &str) -> Option<(f64, f64, f64)> {
    let section = extract_section(output, "LOADAVG")?;
    let mut parts = section.lines().next()?.split_whitespace();
    Some((
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
        parts.next()?.parse().ok()?,
    ))
}

/// Sum of every interface except loopback
fn parse_net_snapshot(output: &str) -> Option<NetSnapshot> {
    let section = extract_section(output, "NETDEV")?;
    let mut total_rx: u64 = 0;
    let mut total_tx: u64 = 0;
    let mut found = false;

    for line in section.lines() {
        let line = line.trim();
        if line.contains('|') || line.is_empty() {
            continue;
        }
        if let Some((iface, rest)) = line.split_once(':') {
            if iface.trim() == "lo" {
                continue;
            }
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if parts.len() >= 9 {
                if let (Ok(rx), Ok(tx)) = (parts[0].parse::<u64>(), parts[8].parse::<u64>()) {
                    total_rx += rx;
                    total_tx += tx;
                    found = true;
                }
            }
        }
    }

    found.then_some(NetSnapshot {
        rx_bytes: total_rx,
        tx_bytes: total_tx,
    })
}

/// First field of /proc/uptime, whole seconds
fn parse_uptime(output: &str) -> Option<u64> {
    let section = extract_section(output, "UPTIME")?;
    let secs: f64 = section.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// Capacity column of `df -P /`
fn parse_disk_percent(output: &str) -> Option<f64> {
    let section = extract_section(output, "DISK")?;
    let line = section.lines().find(|l| !l.starts_with("Filesystem"))?;
    let capacity = line.split_whitespace().nth(4)?;
    capacity.trim_end_matches('%').parse().ok()
}

// ─── Container parser ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DockerStatsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Container", default)]
    container: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemPerc", default)]
    mem_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSample {
    pub id: String,
    pub name: String,
    pub metrics: MetricSet,
}

/// One sample per well-formed line; malformed lines are skipped
pub fn parse_docker_stats(output: &str) -> Vec<ContainerSample> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match serde_json::from_str::<DockerStatsLine>(line) {
            Ok(stats) => container_sample(stats),
            Err(e) => {
                debug!("Skipping docker stats line: {}", e);
                None
            }
        })
        .collect()
}

fn container_sample(stats: DockerStatsLine) -> Option<ContainerSample> {
    let id = if stats.id.is_empty() { stats.container } else { stats.id };
    if id.is_empty() {
        return None;
    }
    let (memory_used, memory_total) = split_pair(&stats.mem_usage);
    let (net_rx, net_tx) = split_pair(&stats.net_io);
    Some(ContainerSample {
        id,
        name: stats.name,
        metrics: MetricSet {
            cpu_percent: parse_percent(&stats.cpu_perc),
            memory_percent: parse_percent(&stats.mem_perc),
            memory_used,
            memory_total,
            net_rx_bytes: net_rx,
            net_tx_bytes: net_tx,
            ..Default::default()
        },
    })
}

/// "1.25%" -> 1.25
fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').parse().ok()
}

/// "1.2kB / 648B" -> (1200, 648)
fn split_pair(value: &str) -> (Option<u64>, Option<u64>) {
    match value.split_once('/') {
        Some((a, b)) => (parse_size(a), parse_size(b)),
        None => (None, None),
    }
}

/// Docker's human sizes: decimal units (kB, MB) and binary units (KiB, MiB)
fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier).round() as u64)
}
