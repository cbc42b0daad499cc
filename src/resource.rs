//! 资源用量类型与换算
//!
//! `ResourceUsageConfig` 是人写的字符串 ("500m", "512Mb"),
//! `ResourceUsageData` 是解析后的数值. 解析失败一律得到 0, 不会出现负数.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 人类可读的资源配额
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUsageConfig {
    pub cpu: String,
    pub memory: String,
    pub disk: String,
    pub gpu: String,
}

impl ResourceUsageConfig {
    pub fn new(cpu: &str, memory: &str, disk: &str, gpu: &str) -> Self {
        Self {
            cpu: cpu.to_string(),
            memory: memory.to_string(),
            disk: disk.to_string(),
            gpu: gpu.to_string(),
        }
    }
}

/// 解析后的资源数值
///
/// - cpu: 核数(可以是小数)
/// - memory / disk: 字节
/// - gpu: 整卡数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsageData {
    pub cpu: f64,
    pub memory: u64,
    pub disk: u64,
    pub gpu: u64,
}

impl ResourceUsageData {
    pub fn new(cpu: f64, memory: u64, disk: u64, gpu: u64) -> Self {
        Self { cpu, memory, disk, gpu }
    }

    /// 四个维度是否全为零
    pub fn is_zero(&self) -> bool {
        self.cpu <= 0.0 && self.memory == 0 && self.disk == 0 && self.gpu == 0
    }

    /// 按维度相加
    pub fn add(&self, other: &ResourceUsageData) -> ResourceUsageData {
        ResourceUsageData {
            cpu: self.cpu + other.cpu,
            memory: self.memory.saturating_add(other.memory),
            disk: self.disk.saturating_add(other.disk),
            gpu: self.gpu.saturating_add(other.gpu),
        }
    }

    /// 按维度相减, 结果不会低于零
    pub fn saturating_sub(&self, other: &ResourceUsageData) -> ResourceUsageData {
        ResourceUsageData {
            cpu: (self.cpu - other.cpu).max(0.0),
            memory: self.memory.saturating_sub(other.memory),
            disk: self.disk.saturating_sub(other.disk),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }
}

impl fmt::Display for ResourceUsageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} memory={} disk={} gpu={}",
            self.cpu, self.memory, self.disk, self.gpu
        )
    }
}

/// 统一单位写法: 小写, `i` 视作 `b` (Mi == Mb), 去掉空格
fn normalize_quantity(value: &str) -> String {
    value
        .to_lowercase()
        .replace('i', "b")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// 拆成数字部分和单位部分
fn split_number(value: &str) -> (&str, &str) {
    let idx = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    value.split_at(idx)
}

fn parse_cpu(value: &str) -> Option<f64> {
    let value = normalize_quantity(value);
    if value.is_empty() {
        return Some(0.0);
    }
    let (number, unit) = split_number(&value);
    let number: f64 = number.parse().ok()?;
    let cores = match unit {
        "" => number,
        "m" => number / 1000.0,
        _ => return None,
    };
    cores.is_finite().then_some(cores)
}

fn parse_bytes(value: &str) -> Option<u64> {
    let value = normalize_quantity(value);
    if value.is_empty() {
        return Some(0);
    }
    let (number, unit) = split_number(&value);
    let number: f64 = number.parse().ok()?;
    let shift = match unit {
        "" | "b" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        "t" | "tb" => 40,
        "p" | "pb" => 50,
        "e" | "eb" => 60,
        _ => return None,
    };
    let bytes = number * (1u64 << shift) as f64;
    (bytes.is_finite() && bytes < u64::MAX as f64).then(|| bytes as u64)
}

/// CPU 字符串 -> 核数 ("500m" = 0.5, "2" = 2.0). 无法解析返回 0
pub fn convert_cpu_string(value: &str) -> f64 {
    parse_cpu(value).unwrap_or(0.0)
}

/// 内存/磁盘字符串 -> 字节数 ("512Mb" / "512Mi" / "512 mb"). 无法解析返回 0
pub fn convert_memory_string(value: &str) -> u64 {
    parse_bytes(value).unwrap_or(0)
}

/// GPU 只接受非负整数, 其它一律为 0
pub fn convert_gpu_string(value: &str) -> u64 {
    value.trim().parse::<u64>().unwrap_or(0)
}

pub fn parse_resource_usage_config(config: &ResourceUsageConfig) -> ResourceUsageData {
    ResourceUsageData {
        cpu: convert_cpu_string(&config.cpu),
        memory: convert_memory_string(&config.memory),
        disk: convert_memory_string(&config.disk),
        gpu: convert_gpu_string(&config.gpu),
    }
}

/// 判断 `wants` 是否放得进 `limits`
///
/// 四个维度都要满足 `wants <= limits`. 例外: `wants` 全为零而 `limits`
/// 有任一正值时返回 false, 因为无法判断这个任务会不会超限.
pub fn check_resource_usage(wants: &ResourceUsageData, limits: &ResourceUsageData) -> bool {
    let limit_over_zero =
        limits.cpu > 0.0 || limits.memory > 0 || limits.disk > 0 || limits.gpu > 0;

    if wants.is_zero() && limit_over_zero {
        return false;
    }

    wants.cpu <= limits.cpu
        && wants.memory <= limits.memory
        && wants.disk <= limits.disk
        && wants.gpu <= limits.gpu
}
