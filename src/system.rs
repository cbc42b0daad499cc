//! 本机资源探测
//!
//! CPU 核数用 num_cpus, 内存/磁盘用 sysinfo, GPU 数量通过
//! `nvidia-container-cli info --csv` 统计.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{DiskExt, System, SystemExt};

use crate::resource::{parse_resource_usage_config, ResourceUsageConfig, ResourceUsageData};
use crate::CapacityError;

/// Nvidia 辅助程序
pub const NVIDIA_CLI: &str = "nvidia-container-cli";

/// 物理资源来源
pub trait SystemResources: Send + Sync {
    fn physical_resources(&self) -> Result<ResourceUsageData, CapacityError>;
}

/// 真实主机
#[derive(Debug, Clone)]
pub struct HostResources {
    storage_path: PathBuf,
}

impl HostResources {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
        }
    }
}

impl SystemResources for HostResources {
    fn physical_resources(&self) -> Result<ResourceUsageData, CapacityError> {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_disks_list();
        sys.refresh_disks();

        Ok(ResourceUsageData {
            cpu: num_cpus::get() as f64,
            memory: sys.total_memory(),
            disk: free_disk_space(&sys, &self.storage_path)?,
            gpu: num_system_gpus()?,
        })
    }
}

/// 固定数值, 用于测试或者已知硬件的部署
#[derive(Debug, Clone, Copy)]
pub struct StaticResources(pub ResourceUsageData);

impl SystemResources for StaticResources {
    fn physical_resources(&self) -> Result<ResourceUsageData, CapacityError> {
        Ok(self.0)
    }
}

/// 取挂载点与 path 前缀匹配最长的那块盘的剩余空间
fn free_disk_space(sys: &System, path: &Path) -> Result<u64, CapacityError> {
    let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    sys.disks()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
        .ok_or_else(|| {
            CapacityError::SystemProbe(format!(
                "unable to get disk space for path {}",
                path.display()
            ))
        })
}

/// 没装 nvidia-container-cli 时认为没有 GPU
fn num_system_gpus() -> Result<u64, CapacityError> {
    let output = match Command::new(NVIDIA_CLI).args(["info", "--csv"]).output() {
        Ok(output) => output,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(CapacityError::SystemProbe(format!("{}: {}", NVIDIA_CLI, e))),
    };
    if !output.status.success() {
        return Err(CapacityError::SystemProbe(format!(
            "{} exited with {}",
            NVIDIA_CLI, output.status
        )));
    }
    Ok(count_gpu_devices(&String::from_utf8_lossy(&output.stdout)))
}

/// 统计 "Device Index" 表头之后的非空行
pub fn count_gpu_devices(csv: &str) -> u64 {
    let mut in_devices = false;
    let mut count = 0;
    for line in csv.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with("Device Index") {
            in_devices = true;
            continue;
        }
        if in_devices {
            count += 1;
        }
    }
    count
}

/// 在物理资源基础上套用配置的总量.
///
/// 配置值超过物理值时报错, 除非 `ignore_physical` 为真.
pub fn get_system_resources(
    limit_config: &ResourceUsageConfig,
    physical: ResourceUsageData,
    ignore_physical: bool,
) -> Result<ResourceUsageData, CapacityError> {
    let configured = parse_resource_usage_config(limit_config);
    let mut resources = physical;

    let exceeds = |dimension: &'static str, configured: String, physical: String| {
        CapacityError::ExceedsPhysical {
            dimension,
            configured,
            physical,
        }
    };

    if configured.cpu > 0.0 {
        if configured.cpu > physical.cpu && !ignore_physical {
            return Err(exceeds("CPU", configured.cpu.to_string(), physical.cpu.to_string()));
        }
        resources.cpu = configured.cpu;
    }
    if configured.memory > 0 {
        if configured.memory > physical.memory && !ignore_physical {
            return Err(exceeds("memory", configured.memory.to_string(), physical.memory.to_string()));
        }
        resources.memory = configured.memory;
    }
    if configured.disk > 0 {
        if configured.disk > physical.disk && !ignore_physical {
            return Err(exceeds("disk", configured.disk.to_string(), physical.disk.to_string()));
        }
        resources.disk = configured.disk;
    }
    if configured.gpu > 0 {
        if configured.gpu > physical.gpu && !ignore_physical {
            return Err(exceeds("GPU", configured.gpu.to_string(), physical.gpu.to_string()));
        }
        resources.gpu = configured.gpu;
    }

    Ok(resources)
}
