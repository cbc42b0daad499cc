//! 这个文件里的测试共用一个进程级环境变量, 只置位不清除


use std::sync::Arc;
use test_utils::{allow_over_commit, test_machine};
use zerg_compute::capacity::{self, should_ignore_physical_resources, CapacityManager, ItemStoreTracker};
use zerg_compute::ResourceUsageConfig;

const GB: u64 = 1024 * 1024 * 1024;

#[test]
fn over_commit_flag_allows_more_than_physical() {
    allow_over_commit();
    assert!(should_ignore_physical_resources());

    let config = capacity::Config {
        resource_limit_total: ResourceUsageConfig::new("64", "256Gb", "", "4"),
        ..capacity::Config::default()
    };
    let manager = CapacityManager::with_system(Arc::new(ItemStoreTracker::new()), &config, &test_machine())
        .expect("over commit allowed");

    let total = manager.resource_limits_total();
    assert!((total.cpu - 64.0).abs() < 1e-9);
    assert_eq!(total.memory, 256 * GB);
    assert_eq!(total.gpu, 4);
}
