use std::time::Duration;
use zerg_compute::{CapacityError, ComputeError, ConfigError, PluginError, SelectionError};

#[test]
fn plugin_errors_read_in_chinese() {
    assert_eq!(
        PluginError::ExecutorNotFound("docker".into()).to_string(),
        "本机没有匹配的执行器: docker"
    );
    assert_eq!(
        PluginError::VerifierNotInstalled("ipfs".into()).to_string(),
        "验证器未安装: ipfs"
    );
    assert_eq!(
        PluginError::Timeout(Duration::from_secs(2)).to_string(),
        "任务执行超时(2s)"
    );
}

#[test]
fn capacity_errors_name_both_values() {
    let err = CapacityError::JobLimitExceedsTotal {
        dimension: "cpu",
        job: "4".into(),
        total: "2".into(),
    };
    assert_eq!(err.to_string(), "单任务资源上限 cpu 4 超过了系统总上限 2");
}

#[test]
fn wrapped_errors_keep_the_inner_message() {
    let err: ComputeError = PluginError::Transport("连接断开".into()).into();
    assert_eq!(err.to_string(), "插件错误: 传输层错误: 连接断开");

    let err: ComputeError = SelectionError::Timeout(Duration::from_millis(200)).into();
    assert_eq!(err.to_string(), "任务选择策略出错: 外部选择超时(200ms)");

    let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: ComputeError = ConfigError::Parse(parse).into();
    assert!(err.to_string().starts_with("配置错误: 解析配置失败: "));
}
