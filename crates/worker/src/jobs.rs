use std::process::Stdio;

use async_trait::async_trait;
use scheduler_core::{
    Job, JobDataMap, JobExecutionContext, JobExecutionError, SchedulerError, SchedulerResult,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 什么也不做的作业，用于只需要监听器回调的场景
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpJob;

impl NoOpJob {
    pub const JOB_TYPE: &'static str = "noop";
}

#[async_trait]
impl Job for NoOpJob {
    async fn execute(&self, context: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        debug!("空作业 {} 执行", context.job_detail().key);
        Ok(())
    }
}

/// 执行本地命令的作业
///
/// 作业数据：
/// - `command`：要执行的程序（必填）
/// - `parameters`：参数数组，或以空白分隔的字符串
/// - `wait_for_process`：是否等待进程结束（默认 true）
/// - `consume_streams`：是否读取并记录输出（默认 false）
///
/// 等待进程时，退出码写入执行结果；非零退出码视为执行失败。
#[derive(Debug, Clone)]
pub struct NativeJob {
    command: String,
    parameters: Vec<String>,
    wait_for_process: bool,
    consume_streams: bool,
}

impl NativeJob {
    pub const JOB_TYPE: &'static str = "native";

    pub fn from_data(data: &JobDataMap) -> SchedulerResult<Self> {
        let command = data
            .get_str("command")
            .filter(|command| !command.trim().is_empty())
            .ok_or_else(|| SchedulerError::JobFactory("本地命令作业缺少 command".to_string()))?
            .to_string();

        let parameters = match data.get("parameters") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(SchedulerError::JobFactory(format!(
                    "无效的 parameters: {other}"
                )))
            }
        };

        Ok(Self {
            command,
            parameters,
            wait_for_process: data.get_bool("wait_for_process").unwrap_or(true),
            consume_streams: data.get_bool("consume_streams").unwrap_or(false),
        })
    }
}

#[async_trait]
impl Job for NativeJob {
    async fn execute(&self, context: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        info!(
            "执行本地命令: command={}, args={:?}",
            self.command, self.parameters
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.parameters).kill_on_drop(self.wait_for_process);
        if self.consume_streams {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| JobExecutionError::new(format!("启动命令 {} 失败: {e}", self.command)))?;

        if !self.wait_for_process {
            return Ok(());
        }

        if self.consume_streams {
            if let Some(stdout) = child.stdout.take() {
                let command = self.command.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        info!("[{}] {}", command, line);
                    }
                });
            }
            if let Some(stderr) = child.stderr.take() {
                let command = self.command.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        warn!("[{}] {}", command, line);
                    }
                });
            }
        }

        let interrupt = context.interrupt_handle().clone();
        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| JobExecutionError::new(format!("等待命令结束失败: {e}")))?,
            _ = interrupt.interrupted() => {
                warn!("命令 {} 被中断，终止进程", self.command);
                if let Err(e) = child.kill().await {
                    warn!("终止进程失败: {}", e);
                }
                return Err(JobExecutionError::new(format!("命令 {} 被中断", self.command)));
            }
        };

        let code = status.code().unwrap_or(-1);
        context.set_result(code);
        if status.success() {
            Ok(())
        } else {
            Err(JobExecutionError::new(format!(
                "命令 {} 以退出码 {} 结束",
                self.command, code
            )))
        }
    }
}
