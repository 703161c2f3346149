//! Metric sources sampled on every poll tick.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::fs;

use parking_lot::Mutex;
use rand::Rng;
use sysinfo::System;
use tracing::trace;

use super::alloc;
use crate::model::{Batch, Metric};

/// Counter incremented once per poll
pub const POLL_COUNT: &str = "PollCount";

/// Uniform random gauge in `[0, 1)`
pub const RANDOM_VALUE: &str = "RandomValue";

/// Runtime memory gauges, always emitted in this order
pub const RUNTIME_GAUGES: [&str; 26] = [
    "Alloc",
    "TotalAlloc",
    "TotalFreed",
    "Mallocs",
    "Frees",
    "Reallocs",
    "HeapObjects",
    "PeakAlloc",
    "VmPeak",
    "VmSize",
    "VmLck",
    "VmPin",
    "VmHWM",
    "VmRSS",
    "RssAnon",
    "RssFile",
    "RssShmem",
    "VmData",
    "VmStk",
    "VmExe",
    "VmLib",
    "VmPTE",
    "VmSwap",
    "Threads",
    "MinorFaults",
    "MajorFaults",
];

// ============================================================================
// COLLECTOR TRAIT
// ============================================================================

/// A synchronous metric source.
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    fn collect(&self) -> Batch;
}

// ============================================================================
// RUNTIME COLLECTOR
// ============================================================================

/// Poll counter, allocator and `/proc/self` memory statistics, random value.
#[derive(Debug, Default)]
pub struct RuntimeCollector;

impl RuntimeCollector {
    pub fn new() -> Self {
        Self
    }

    fn runtime_values() -> [f64; 26] {
        let heap = alloc::snapshot();
        let status = read_proc("/proc/self/status").map(|text| parse_status(&text)).unwrap_or_default();
        let faults = read_proc("/proc/self/stat").and_then(|text| parse_page_faults(&text)).unwrap_or_default();
        let proc_field = |key: &str| status.get(key).copied().unwrap_or(0) as f64;

        [
            heap.live_bytes as f64,
            heap.total_allocated as f64,
            heap.total_freed as f64,
            heap.mallocs as f64,
            heap.frees as f64,
            heap.reallocs as f64,
            heap.live_objects() as f64,
            heap.peak_bytes as f64,
            proc_field("VmPeak"),
            proc_field("VmSize"),
            proc_field("VmLck"),
            proc_field("VmPin"),
            proc_field("VmHWM"),
            proc_field("VmRSS"),
            proc_field("RssAnon"),
            proc_field("RssFile"),
            proc_field("RssShmem"),
            proc_field("VmData"),
            proc_field("VmStk"),
            proc_field("VmExe"),
            proc_field("VmLib"),
            proc_field("VmPTE"),
            proc_field("VmSwap"),
            proc_field("Threads"),
            faults.minor as f64,
            faults.major as f64,
        ]
    }
}

impl Collector for RuntimeCollector {
    fn name(&self) -> &'static str {
        "runtime"
    }

    fn collect(&self) -> Batch {
        let mut batch = Vec::with_capacity(RUNTIME_GAUGES.len() + 2);
        batch.push(Metric::counter(POLL_COUNT, 1));
        batch.extend(
            RUNTIME_GAUGES
                .iter()
                .zip(Self::runtime_values())
                .map(|(name, value)| Metric::gauge(*name, value)),
        );
        batch.push(Metric::gauge(RANDOM_VALUE, rand::thread_rng().gen::<f64>()));
        batch
    }
}

fn read_proc(path: &str) -> Option<String> {
    fs::read_to_string(path).ok()
}

/// `Key:   value [kB]` lines; kB values are converted to bytes.
fn parse_status(text: &str) -> HashMap<String, u64> {
    text.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value: u64 = parts.next()?.parse().ok()?;
            let value = match parts.next() {
                Some("kB") => value * 1024,
                _ => value,
            };
            Some((key.trim().to_string(), value))
        })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PageFaults {
    minor: u64,
    major: u64,
}

/// Fields after the parenthesised command name start at `state` (field 3),
/// so minflt (10) and majflt (12) sit at offsets 7 and 9.
fn parse_page_faults(text: &str) -> Option<PageFaults> {
    let (_, after_comm) = text.rsplit_once(')')?;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    Some(PageFaults { minor: fields.get(7)?.parse().ok()?, major: fields.get(9)?.parse().ok()? })
}

// ============================================================================
// HOST COLLECTOR
// ============================================================================

/// Host memory and CPU utilization via `sysinfo`.
///
/// CPU usage is measured between consecutive refreshes, so the first sample
/// reports zero.
pub struct HostCollector {
    system: Mutex<System>,
}

impl Debug for HostCollector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCollector").finish_non_exhaustive()
    }
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl HostCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self { system: Mutex::new(system) }
    }
}

impl Collector for HostCollector {
    fn name(&self) -> &'static str {
        "host"
    }

    fn collect(&self) -> Batch {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu();

        let mut batch = Vec::with_capacity(system.cpus().len() + 3);
        batch.push(Metric::gauge("TotalMemory", system.total_memory() as f64));
        batch.push(Metric::gauge("FreeMemory", system.free_memory() as f64));
        batch.push(Metric::gauge("CPUutilization1", system.global_cpu_info().cpu_usage() as f64));
        for (index, cpu) in system.cpus().iter().enumerate() {
            batch.push(Metric::gauge(format!("CPUutilization{}", index + 2), cpu.cpu_usage() as f64));
        }

        trace!(target: "relay::agent", cpus = system.cpus().len(), "Host sample taken");
        batch
    }
}
