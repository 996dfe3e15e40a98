// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 评分线程池 (WorkerPool)
//!
//! 一帧内的多个检测并行评分, 提交一批任务后阻塞直到全部完成.
//! 单个任务出错或 panic 只影响该任务, 以 `Err` 形式返回.

use std::panic::{self, AssertUnwindSafe};

use rayon::prelude::*;
use tracing::info;

use crate::error::TaskError;

/// 自动模式下的线程数上限, 给 GPU 推理线程留出 CPU
pub const MAX_AUTO_WORKERS: usize = 8;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    size: usize,
}

impl WorkerPool {
    /// 创建线程池, `requested == 0` 时按 CPU 核数自动选择 (不超过 [`MAX_AUTO_WORKERS`])
    pub fn new(requested: usize, name: &str) -> anyhow::Result<Self> {
        let size = Self::resolve_size(requested);
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()?;
        info!("🧵 评分线程池: {} 个线程 ({})", size, name);
        Ok(Self { pool, size })
    }

    pub fn resolve_size(requested: usize) -> usize {
        if requested > 0 {
            return requested;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, MAX_AUTO_WORKERS)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 提交一批任务, 阻塞等待全部完成, 结果顺序与输入一致
    pub fn submit<T, R, F>(&self, items: Vec<T>, task: F) -> Vec<Result<R, TaskError>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> anyhow::Result<R> + Sync + Send,
    {
        self.pool.install(|| {
            items
                .into_par_iter()
                .enumerate()
                .map(|(index, item)| {
                    match panic::catch_unwind(AssertUnwindSafe(|| task(item))) {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(TaskError::Failed {
                            index,
                            message: format!("{:#}", e),
                        }),
                        Err(payload) => Err(TaskError::Panicked {
                            index,
                            message: panic_message(payload.as_ref()),
                        }),
                    }
                })
                .collect()
        })
    }

    /// 在线程池内执行整块工作 (如批量评分), panic 转为错误
    pub fn run<R, F>(&self, work: F) -> Result<R, TaskError>
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool
            .install(|| panic::catch_unwind(AssertUnwindSafe(work)))
            .map_err(|payload| TaskError::Panicked {
                index: 0,
                message: panic_message(payload.as_ref()),
            })
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn results_keep_input_order() {
        let pool = WorkerPool::new(4, "test").unwrap();
        let results = pool.submit((0..100).collect(), |x: u32| Ok(x * 2));
        let values: Vec<u32> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..100).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn failures_are_isolated() {
        let pool = WorkerPool::new(2, "test").unwrap();
        let done = AtomicUsize::new(0);
        let results = pool.submit(vec![1, 2, 3, 4], |x: i32| {
            done.fetch_add(1, Ordering::SeqCst);
            match x {
                2 => anyhow::bail!("bad item"),
                3 => panic!("boom"),
                _ => Ok(x),
            }
        });

        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(matches!(results[1], Err(TaskError::Failed { index: 1, .. })));
        assert!(matches!(
            results[2],
            Err(TaskError::Panicked { index: 2, ref message }) if message == "boom"
        ));
        assert_eq!(results[3].as_ref().unwrap(), &4);

        // 线程池仍可继续使用
        let again = pool.submit(vec![5], |x: i32| Ok(x));
        assert_eq!(again[0].as_ref().unwrap(), &5);
    }

    #[test]
    fn auto_size_is_capped() {
        let size = WorkerPool::resolve_size(0);
        assert!((1..=MAX_AUTO_WORKERS).contains(&size));
        assert_eq!(WorkerPool::resolve_size(3), 3);
    }

    #[test]
    fn run_catches_panics() {
        let pool = WorkerPool::new(1, "test").unwrap();
        assert_eq!(pool.run(|| 7).unwrap(), 7);
        assert!(pool.run(|| -> i32 { panic!("whole batch") }).is_err());
    }
}
