//! GPU telemetry, from `nvidia-smi` or NVML.

use nvml_wrapper::Nvml;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, find_in_path, spawn_blocking_propagating_panics},
    prelude::*,
};

/// A point-in-time snapshot of one GPU.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GpuStat {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_percent: u32,
}

/// All visible GPUs.
#[derive(Clone, Debug, Serialize)]
pub struct GpuTelemetry {
    pub gpu_count: usize,
    pub gpus: Vec<GpuStat>,
}

impl From<Vec<GpuStat>> for GpuTelemetry {
    fn from(gpus: Vec<GpuStat>) -> Self {
        Self {
            gpu_count: gpus.len(),
            gpus,
        }
    }
}

/// Parse `nvidia-smi --format=csv,noheader,nounits` output. Lines that don't
/// have exactly five fields are skipped, and unparseable numbers become 0.
pub fn parse_nvidia_smi_csv(output: &str) -> Vec<GpuStat> {
    output
        .lines()
        .filter_map(|line| {
            let parts = line.split(',').map(str::trim).collect::<Vec<_>>();
            let [index, name, total, used, utilization] = parts.as_slice() else {
                return None;
            };
            Some(GpuStat {
                index: index.parse().unwrap_or(0),
                name: (*name).to_owned(),
                memory_total_mb: total.parse().unwrap_or(0),
                memory_used_mb: used.parse().unwrap_or(0),
                utilization_percent: utilization.parse().unwrap_or(0),
            })
        })
        .collect()
}

async fn query_nvidia_smi() -> Result<Vec<GpuStat>> {
    if find_in_path("nvidia-smi").is_none() {
        return Ok(vec![]);
    }
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=index,name,memory.total,memory.used,utilization.gpu")
        .arg("--format=csv,noheader,nounits")
        .output()
        .await
        .context("failed to run nvidia-smi")?;
    check_for_command_failure("nvidia-smi", &output, None)?;
    Ok(parse_nvidia_smi_csv(&String::from_utf8_lossy(&output.stdout)))
}

fn query_nvml() -> Result<Vec<GpuStat>> {
    let nvml = Nvml::init().context("failed to initialize NVML")?;
    let count = nvml.device_count().context("failed to count NVML devices")?;
    let mut stats = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = nvml
            .device_by_index(index)
            .with_context(|| format!("failed to open GPU {index}"))?;
        let memory = device
            .memory_info()
            .with_context(|| format!("failed to read memory info for GPU {index}"))?;
        stats.push(GpuStat {
            index,
            name: device.name().unwrap_or_default(),
            memory_total_mb: memory.total / (1024 * 1024),
            memory_used_mb: memory.used / (1024 * 1024),
            utilization_percent: device
                .utilization_rates()
                .map(|rates| rates.gpu)
                .unwrap_or(0),
        });
    }
    Ok(stats)
}

/// Query every visible GPU. Failures are logged and reported as "no GPUs".
#[instrument(level = "debug")]
pub async fn query_gpu_stats() -> Vec<GpuStat> {
    match query_nvidia_smi().await {
        Ok(stats) if !stats.is_empty() => return stats,
        Ok(_) => {}
        Err(err) => warn!("nvidia-smi query failed: {err:#}"),
    }
    match spawn_blocking_propagating_panics(query_nvml).await {
        Ok(stats) => stats,
        Err(err) => {
            debug!("NVML query failed: {err:#}");
            vec![]
        }
    }
}

/// How many GPUs can we schedule onto? An explicit override wins.
pub async fn detect_gpu_count(override_count: Option<usize>) -> usize {
    match override_count {
        Some(count) => count,
        None => query_gpu_stats().await.len(),
    }
}
