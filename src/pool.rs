//! 워커 풀
//!
//! rayon 스레드 풀 위에서 채널 처리, 패킷 처리 같은 짧은 태스크를 실행한다.
//! accept/디스패치/수신 루프처럼 오래 도는 루프는 여기서 돌리지 않는다.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

use crate::{Error, Result};

struct PoolInner {
    pool: ThreadPool,
    threads: usize,
    shutdown: AtomicBool,
    /// 실행 중이거나 대기 중인 태스크 수
    pending: Arc<AtomicUsize>,
}

/// 멀티스레드 워커 풀 (복제 시 같은 풀을 공유)
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.inner.threads)
            .field("shutdown", &self.is_shutdown())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerPool {
    /// 새 워커 풀 생성 (0이면 CPU 코어 수 사용)
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            threads
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sockloop-worker-{}", i))
            .panic_handler(|payload| {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("워커 태스크 패닉: {}", msg);
            })
            .build()
            .map_err(|e| Error::config(format!("워커 풀 생성 실패: {}", e)))?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                threads: pool.current_num_threads(),
                pool,
                shutdown: AtomicBool::new(false),
                pending: Arc::new(AtomicUsize::new(0)),
            }),
        })
    }

    /// 워커 스레드 수
    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    pub fn is_multi_threaded(&self) -> bool {
        self.inner.threads > 1
    }

    /// 태스크 제출. 종료된 풀이면 `Error::PoolShutdown`
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::PoolShutdown);
        }

        let pending = self.inner.pending.clone();
        pending.fetch_add(1, Ordering::AcqRel);
        self.inner.pool.spawn(move || {
            let _pending = PendingGuard(&pending);
            task();
        });
        Ok(())
    }

    /// 새 태스크 거부. 이미 제출된 태스크는 끝까지 실행된다
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// 완료되지 않은 태스크 수
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }
}

/// 패닉이 나도 카운터를 되돌린다
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 빌드 시점 풀 검증
pub(crate) fn require_multi_threaded(pool: Option<WorkerPool>) -> Result<WorkerPool> {
    let pool = pool.ok_or_else(|| Error::config("워커 풀이 지정되지 않음"))?;
    if !pool.is_multi_threaded() {
        return Err(Error::config(format!(
            "단일 스레드 워커 풀은 사용할 수 없음: threads={}",
            pool.threads()
        )));
    }
    if pool.is_shutdown() {
        return Err(Error::config("이미 종료된 워커 풀"));
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    #[test]
    fn test_execute_runs_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..16 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 16 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        assert!(matches!(pool.execute(|| {}), Err(Error::PoolShutdown)));
    }

    #[test]
    fn test_single_threaded_pool_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        assert!(matches!(
            require_multi_threaded(Some(pool)),
            Err(Error::Config(_))
        ));
        assert!(require_multi_threaded(None).is_err());
        assert!(require_multi_threaded(Some(WorkerPool::new(2).unwrap())).is_ok());
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let pool = WorkerPool::new(2).unwrap();
        pool.execute(|| panic!("boom")).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        pool.execute(move || {
            let _ = tx.send(7);
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}
