use approx::assert_relative_eq;
use proptest::prelude::*;
use zerg_compute::resource::{
    convert_cpu_string, convert_gpu_string, convert_memory_string, parse_resource_usage_config,
    ResourceUsageConfig, ResourceUsageData,
};
use zerg_compute::system::{count_gpu_devices, get_system_resources};
use zerg_compute::CapacityError;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

#[test]
fn cpu_strings() {
    assert_relative_eq!(convert_cpu_string("1"), 1.0);
    assert_relative_eq!(convert_cpu_string("0.5"), 0.5);
    assert_relative_eq!(convert_cpu_string("500m"), 0.5);
    assert_relative_eq!(convert_cpu_string("100m"), 0.1);
    assert_relative_eq!(convert_cpu_string(" 2 "), 2.0);
    assert_relative_eq!(convert_cpu_string(""), 0.0);
    assert_relative_eq!(convert_cpu_string("lots"), 0.0);
}

#[test]
fn byte_strings() {
    assert_eq!(convert_memory_string("100Mb"), 100 * MB);
    assert_eq!(convert_memory_string("100Mi"), 100 * MB);
    assert_eq!(convert_memory_string("100 mb"), 100 * MB);
    assert_eq!(convert_memory_string("1Gb"), GB);
    assert_eq!(convert_memory_string("1.5GB"), GB + GB / 2);
    assert_eq!(convert_memory_string("2kb"), 2 * KB);
    assert_eq!(convert_memory_string("512"), 512);
    assert_eq!(convert_memory_string(""), 0);
    assert_eq!(convert_memory_string("a lot"), 0);
}

#[test]
fn gpu_strings() {
    assert_eq!(convert_gpu_string("2"), 2);
    assert_eq!(convert_gpu_string(" 1 "), 1);
    assert_eq!(convert_gpu_string("1.5"), 0);
    assert_eq!(convert_gpu_string("-1"), 0);
    assert_eq!(convert_gpu_string(""), 0);
}

#[test]
fn parse_full_config() {
    let data = parse_resource_usage_config(&ResourceUsageConfig::new("250m", "1Gb", "10Gb", "1"));
    assert_relative_eq!(data.cpu, 0.25);
    assert_eq!(data.memory, GB);
    assert_eq!(data.disk, 10 * GB);
    assert_eq!(data.gpu, 1);
}

#[test]
fn add_and_saturating_sub() {
    let a = ResourceUsageData::new(1.0, GB, 0, 1);
    let b = ResourceUsageData::new(2.5, 2 * GB, MB, 0);

    let sum = a.add(&b);
    assert_relative_eq!(sum.cpu, 3.5);
    assert_eq!(sum.memory, 3 * GB);
    assert_eq!(sum.disk, MB);

    let diff = a.saturating_sub(&b);
    assert_relative_eq!(diff.cpu, 0.0);
    assert_eq!(diff.memory, 0);
    assert_eq!(diff.disk, 0);
    assert_eq!(diff.gpu, 1);
    assert!(ResourceUsageData::default().is_zero());
    assert!(!a.is_zero());
}

#[test]
fn configured_totals_override_physical() {
    let physical = ResourceUsageData::new(8.0, 16 * GB, 100 * GB, 0);
    let resources = get_system_resources(
        &ResourceUsageConfig::new("2", "", "10Gb", ""),
        physical,
        false,
    )
    .expect("within physical limits");

    assert_relative_eq!(resources.cpu, 2.0);
    assert_eq!(resources.memory, 16 * GB);
    assert_eq!(resources.disk, 10 * GB);
    assert_eq!(resources.gpu, 0);
}

#[test]
fn configured_totals_above_physical() {
    let physical = ResourceUsageData::new(8.0, 16 * GB, 100 * GB, 0);
    let config = ResourceUsageConfig::new("", "32Gb", "", "");

    let err = get_system_resources(&config, physical, false).unwrap_err();
    assert!(matches!(err, CapacityError::ExceedsPhysical { dimension: "memory", .. }));

    let resources = get_system_resources(&config, physical, true).expect("over commit allowed");
    assert_eq!(resources.memory, 32 * GB);
}

#[test]
fn gpu_csv_counting() {
    let csv = "NVRM version:   470.57.02\nCUDA version:   11.4\n\n\
               Device Index, Device Minor, Model\n\
               0, 0, Tesla T4\n\
               1, 1, Tesla T4\n";
    assert_eq!(count_gpu_devices(csv), 2);
    assert_eq!(count_gpu_devices("NVRM version: 1\n"), 0);
}

proptest! {
    #[test]
    fn millicores_match_cores(millis in 0u32..64_000) {
        let from_millis = convert_cpu_string(&format!("{}m", millis));
        prop_assert!((from_millis - millis as f64 / 1000.0).abs() < 1e-9);
    }

    #[test]
    fn megabytes_scale(mb in 0u64..1_000_000) {
        prop_assert_eq!(convert_memory_string(&format!("{}Mb", mb)), mb * MB);
        prop_assert_eq!(convert_memory_string(&format!("{}Mi", mb)), mb * MB);
    }
}
