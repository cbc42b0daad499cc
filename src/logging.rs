//! 日志初始化与任务事件日志

use serde::Serialize;
use std::sync::Once;

/// 任务事件日志的 target, 方便单独过滤
pub const JOB_EVENT_TARGET: &str = "job_event";

static INIT: Once = Once::new();

/// 初始化 env_logger, 默认级别 info, 可用 RUST_LOG 覆盖. 重复调用无副作用
pub fn init_logger() {
    INIT.call_once(|| {
        let env = env_logger::Env::default().default_filter_or("info");
        if let Err(e) = env_logger::Builder::from_env(env).try_init() {
            eprintln!("logger already initialised: {}", e);
        }
    });
}

/// 一条任务事件
#[derive(Debug, Clone, Serialize)]
pub struct JobLogEvent<'a> {
    pub node: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub job: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl<'a> JobLogEvent<'a> {
    pub fn new(node: &'a str, kind: &'a str, job: &'a str) -> Self {
        Self {
            node,
            kind,
            job,
            shard: None,
            data: None,
        }
    }

    pub fn shard(mut self, index: usize) -> Self {
        self.shard = Some(index);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// 以单行 JSON 写出
pub fn log_job_event(event: &JobLogEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => log::info!(target: JOB_EVENT_TARGET, "{}", line),
        Err(e) => log::error!("failed to marshal job event: {}", e),
    }
}
