// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 连接监督 (ConnectionSupervisor)
//!
//! CONNECTING → CONNECTED → (读取失败) CONNECTING → ... → FAILED
//! - 每次连接失败计数 +1, 只有连接成功才清零
//! - 两次尝试之间固定间隔, 不做指数退避
//! - 连续失败达到上限进入 FAILED, 只结束本摄像头

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{error, info, warn};

use super::shutdown::ShutdownSignal;
use crate::config::ReconnectConfig;
use crate::error::SourceError;
use crate::input::FrameSource;

/// 连接状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
        })
    }
}

/// 摄像头连接状态, 只由本摄像头的 ConnectionSupervisor 修改
#[derive(Clone, Debug)]
pub struct CameraState {
    pub status: ConnectionStatus,
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Local>>,
}

/// 连接结果
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// 连续失败次数达到上限
    Failed { attempts: u32 },
    /// 等待期间收到关闭信号
    Shutdown,
}

/// 等待函数: 返回 true 表示等待被关闭信号打断
type Waiter = Box<dyn FnMut(Duration) -> bool + Send>;

pub struct ConnectionSupervisor {
    camera: u32,
    policy: ReconnectConfig,
    state: CameraState,
    wait: Waiter,
}

impl ConnectionSupervisor {
    pub fn new(camera: u32, policy: ReconnectConfig, shutdown: ShutdownSignal) -> Self {
        Self::with_waiter(camera, policy, move |delay| shutdown.wait(delay))
    }

    /// 自定义等待方式 (测试中记录等待时长)
    pub fn with_waiter(
        camera: u32,
        policy: ReconnectConfig,
        wait: impl FnMut(Duration) -> bool + Send + 'static,
    ) -> Self {
        Self {
            camera,
            policy,
            state: CameraState {
                status: ConnectionStatus::Connecting,
                consecutive_failures: 0,
                last_attempt: None,
            },
            wait: Box::new(wait),
        }
    }

    pub fn state(&self) -> &CameraState {
        &self.state
    }

    /// 反复尝试连接, 直到成功/达到上限/收到关闭信号
    pub fn connect<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> ConnectOutcome {
        self.transition(ConnectionStatus::Connecting);
        loop {
            self.state.last_attempt = Some(Local::now());
            info!(
                camera = self.camera,
                "🔌 连接 {} (第 {} 次尝试)",
                source.address(),
                self.state.consecutive_failures + 1
            );

            match source.connect() {
                Ok(()) => {
                    self.state.consecutive_failures = 0;
                    self.transition(ConnectionStatus::Connected);
                    return ConnectOutcome::Connected;
                }
                Err(e) => {
                    self.state.consecutive_failures += 1;
                    let attempts = self.state.consecutive_failures;
                    warn!(
                        camera = self.camera,
                        "⚠️ 连接失败 ({}/{}): {}",
                        attempts,
                        self.policy.max_attempts,
                        e
                    );
                    if attempts >= self.policy.max_attempts {
                        self.transition(ConnectionStatus::Failed);
                        return ConnectOutcome::Failed { attempts };
                    }
                    info!(camera = self.camera, "🔄 {}ms 后重试", self.policy.delay_ms);
                    if (self.wait)(self.policy.delay()) {
                        return ConnectOutcome::Shutdown;
                    }
                }
            }
        }
    }

    /// 读取失败: 回到 CONNECTING 并等待固定间隔; 返回 false 表示等待期间收到关闭信号
    pub fn on_read_failure(&mut self, err: &SourceError) -> bool {
        warn!(camera = self.camera, "⚠️ 读取失败: {}", err);
        self.transition(ConnectionStatus::Connecting);
        info!(camera = self.camera, "🔄 {}ms 后重连", self.policy.delay_ms);
        !(self.wait)(self.policy.delay())
    }

    fn transition(&mut self, next: ConnectionStatus) {
        let prev = self.state.status;
        if prev == next {
            return;
        }
        self.state.status = next;
        match next {
            ConnectionStatus::Connected => {
                info!(camera = self.camera, from = %prev, to = %next, "✅ 连接成功")
            }
            ConnectionStatus::Connecting => {
                info!(camera = self.camera, from = %prev, to = %next, "🔄 重新连接")
            }
            ConnectionStatus::Failed => error!(
                camera = self.camera,
                from = %prev,
                to = %next,
                "❌ 连续 {} 次连接失败, 放弃",
                self.state.consecutive_failures
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::{Arc, Mutex};

    /// 按脚本返回连接结果的输入源
    struct ScriptedSource {
        results: Vec<bool>,
        calls: usize,
    }

    impl FrameSource for ScriptedSource {
        fn address(&self) -> &str {
            "scripted://"
        }

        fn connect(&mut self) -> Result<(), SourceError> {
            let ok = self.results.get(self.calls).copied().unwrap_or(false);
            self.calls += 1;
            if ok {
                Ok(())
            } else {
                Err(SourceError::Connect {
                    address: "scripted://".to_string(),
                    reason: "refused".to_string(),
                })
            }
        }

        fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
            Ok(None)
        }
    }

    fn recording(max_attempts: u32) -> (ConnectionSupervisor, Arc<Mutex<Vec<Duration>>>) {
        let waits = Arc::new(Mutex::new(Vec::new()));
        let log = waits.clone();
        let policy = ReconnectConfig {
            delay_ms: 250,
            max_attempts,
        };
        let supervisor = ConnectionSupervisor::with_waiter(7, policy, move |d| {
            log.lock().unwrap().push(d);
            false
        });
        (supervisor, waits)
    }

    #[test]
    fn fails_after_max_attempts_with_fixed_delay() {
        let (mut supervisor, waits) = recording(3);
        let mut source = ScriptedSource {
            results: vec![],
            calls: 0,
        };
        assert_eq!(
            supervisor.connect(&mut source),
            ConnectOutcome::Failed { attempts: 3 }
        );
        assert_eq!(source.calls, 3);
        assert_eq!(*waits.lock().unwrap(), vec![Duration::from_millis(250); 2]);
        assert_eq!(supervisor.state().status, ConnectionStatus::Failed);
        assert!(supervisor.state().last_attempt.is_some());
    }

    #[test]
    fn success_resets_counter() {
        let (mut supervisor, waits) = recording(3);
        let mut source = ScriptedSource {
            results: vec![false, false, true, false, false, true],
            calls: 0,
        };
        assert_eq!(supervisor.connect(&mut source), ConnectOutcome::Connected);
        assert_eq!(supervisor.state().consecutive_failures, 0);
        assert_eq!(supervisor.state().status, ConnectionStatus::Connected);

        // 读取失败后重新计数, 再失败两次仍未达到上限
        let err = SourceError::Read {
            address: "scripted://".to_string(),
            reason: "eof".to_string(),
        };
        assert!(supervisor.on_read_failure(&err));
        assert_eq!(supervisor.state().status, ConnectionStatus::Connecting);
        assert_eq!(supervisor.connect(&mut source), ConnectOutcome::Connected);
        assert_eq!(supervisor.state().consecutive_failures, 0);
        assert_eq!(waits.lock().unwrap().len(), 2 + 1 + 2);
    }

    #[test]
    fn shutdown_interrupts_backoff() {
        let policy = ReconnectConfig {
            delay_ms: 60_000,
            max_attempts: 5,
        };
        let signal = ShutdownSignal::new();
        signal.trigger();
        let mut supervisor = ConnectionSupervisor::new(1, policy, signal);
        let mut source = ScriptedSource {
            results: vec![],
            calls: 0,
        };
        assert_eq!(supervisor.connect(&mut source), ConnectOutcome::Shutdown);
        assert_eq!(source.calls, 1);
    }
}
