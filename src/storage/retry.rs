use std::time::Duration;

use crate::storage::gateway::GatewayError;

/// 网关持有的重试策略：失败后强制重连，再试一次（默认）。
///
/// 第二次连续失败直接上抛，避免持锁线程无限阻塞。
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// 无退避（测试 / 内存网关）
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    /// 执行 `op`；瞬时错误时调用 `reconnect` 后重试，直到用尽次数。
    ///
    /// `ctx` 由调用方持锁后传入（通常是连接槽位），`reconnect` 与 `op` 轮流借用。
    pub fn run<C, T>(
        &self,
        what: &str,
        ctx: &mut C,
        mut reconnect: impl FnMut(&mut C) -> Result<(), GatewayError>,
        mut op: impl FnMut(&mut C) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match op(ctx) {
                Ok(v) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded on attempt {}", what, attempt);
                    }
                    return Ok(v);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}), forcing reconnect: {}",
                        what,
                        attempt,
                        attempts,
                        e
                    );
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff * attempt);
                    }
                    if let Err(re) = reconnect(ctx) {
                        tracing::warn!("{}: reconnect failed: {}", what, re);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
