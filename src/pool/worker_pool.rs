// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/worker_pool.rs - 有界工作线程池
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  any::Any,
  collections::{HashMap, VecDeque},
  panic::{self, AssertUnwindSafe},
  sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc},
  thread::{self, JoinHandle, ThreadId},
  time::Duration,
};

use tracing::{debug, info, trace};

use crate::pool::PoolError;

type Job = Box<dyn FnOnce(&Shared) + Send + 'static>;

#[derive(Default)]
struct State {
  queue: VecDeque<Job>,
  quit: bool,
  live: usize,
  busy: usize,
  peak: usize,
  threads: HashMap<ThreadId, JoinHandle<()>>,
  finished: Vec<ThreadId>,
}

struct Shared {
  state: Mutex<State>,
  condition: Condvar,
  idle_timeout: Duration,
  max_workers: usize,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, State> {
    // 任务在锁外执行，锁内不会 panic
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// 按需创建线程的有界线程池
///
/// 空闲线程不足以领取排队任务且线程数未达上限时才创建新线程；空闲超过 `idle_timeout`
/// 的线程自行退出，由之后的线程池操作回收。任务按提交顺序 (FIFO) 分发。
pub struct WorkerPool {
  shared: Arc<Shared>,
}

/// 已提交任务的结果句柄
pub struct TaskHandle<T> {
  receiver: mpsc::Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
  /// 非阻塞查询；`None` 表示任务尚未完成
  pub fn try_wait(&self) -> Option<Result<T, PoolError>> {
    match self.receiver.try_recv() {
      Ok(result) => Some(result),
      Err(mpsc::TryRecvError::Empty) => None,
      Err(mpsc::TryRecvError::Disconnected) => Some(Err(PoolError::Cancelled)),
    }
  }

  /// 最多等待 `timeout`；`None` 表示超时，句柄仍可继续等待
  pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, PoolError>> {
    match self.receiver.recv_timeout(timeout) {
      Ok(result) => Some(result),
      Err(mpsc::RecvTimeoutError::Timeout) => None,
      Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(PoolError::Cancelled)),
    }
  }

  pub fn wait(self) -> Result<T, PoolError> {
    self.receiver.recv().unwrap_or(Err(PoolError::Cancelled))
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "未知 panic".to_string()
  }
}

impl WorkerPool {
  /// 创建线程池并预先启动一个工作线程，无法创建线程时立即返回错误
  pub fn new(max_workers: usize, idle_timeout: Duration) -> Result<Self, PoolError> {
    if max_workers == 0 {
      return Err(PoolError::NoWorkers);
    }

    let pool = WorkerPool {
      shared: Arc::new(Shared {
        state: Mutex::new(State::default()),
        condition: Condvar::new(),
        idle_timeout,
        max_workers,
      }),
    };

    {
      let mut state = pool.shared.lock();
      Self::spawn_worker(&pool.shared, &mut state)?;
    }
    info!("线程池已创建，最大线程数: {}", max_workers);
    Ok(pool)
  }

  pub fn max_workers(&self) -> usize {
    self.shared.max_workers
  }

  /// 当前存活的工作线程数
  pub fn live_workers(&self) -> usize {
    let mut state = self.shared.lock();
    let finished = Self::take_finished(&mut state);
    let live = state.live;
    drop(state);
    Self::join_all(finished);
    live
  }

  /// 线程池创建以来同时存活线程数的峰值
  pub fn peak_workers(&self) -> usize {
    self.shared.lock().peak
  }

  /// 排队中尚未被领取的任务数
  pub fn queued(&self) -> usize {
    self.shared.lock().queue.len()
  }

  pub fn submit<F, T>(&self, func: F) -> Result<TaskHandle<T>, PoolError>
  where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
  {
    self
      .submit_with((), move |()| func())
      .map_err(|(e, ())| e)
  }

  /// 提交以 `payload` 为参数的任务；提交失败时连同 `payload` 一起返回
  pub fn submit_with<P, F, T>(
    &self,
    payload: P,
    func: F,
  ) -> Result<TaskHandle<T>, (PoolError, P)>
  where
    P: Send + 'static,
    F: FnOnce(P) -> T + Send + 'static,
    T: Send + 'static,
  {
    let mut state = self.shared.lock();
    if state.quit {
      return Err((PoolError::Closed, payload));
    }
    let finished = Self::take_finished(&mut state);

    // 未在执行任务的线程都能领取排队任务
    let available = state.live - state.busy;
    if available <= state.queue.len() && state.live < self.shared.max_workers {
      if let Err(e) = Self::spawn_worker(&self.shared, &mut state) {
        if state.live == 0 {
          drop(state);
          Self::join_all(finished);
          return Err((e, payload));
        }
        debug!("创建工作线程失败，任务排队等待: {}", e);
      }
    }

    let (sender, receiver) = mpsc::sync_channel(1);
    let job: Job = Box::new(move |shared: &Shared| {
      let result = panic::catch_unwind(AssertUnwindSafe(move || func(payload)))
        .map_err(|panic| PoolError::Panicked(panic_message(panic)));
      // 先标记空闲再发送结果
      shared.lock().busy -= 1;
      // 调用方可能已丢弃句柄
      let _ = sender.send(result);
    });
    state.queue.push_back(job);
    self.shared.condition.notify_one();
    drop(state);

    Self::join_all(finished);
    Ok(TaskHandle { receiver })
  }

  /// 通知所有线程退出并等待其结束；队列中剩余的任务会先执行完毕
  pub fn shutdown(&self) {
    let threads: Vec<JoinHandle<()>> = {
      let mut state = self.shared.lock();
      if state.quit && state.threads.is_empty() {
        return;
      }
      state.quit = true;
      state.finished.clear();
      state.threads.drain().map(|(_, handle)| handle).collect()
    };
    self.shared.condition.notify_all();

    let count = threads.len();
    Self::join_all(threads);
    info!("线程池已关闭，回收 {} 个线程", count);
  }

  fn spawn_worker(shared: &Arc<Shared>, state: &mut State) -> Result<(), PoolError> {
    let worker_shared = Arc::clone(shared);
    let handle = thread::Builder::new()
      .name(format!("tile-worker-{}", state.live))
      .spawn(move || Self::worker_loop(worker_shared))?;

    state.threads.insert(handle.thread().id(), handle);
    state.live += 1;
    state.peak = state.peak.max(state.live);
    trace!("创建工作线程，当前线程数: {}", state.live);
    Ok(())
  }

  fn worker_loop(shared: Arc<Shared>) {
    loop {
      let job = {
        let state = shared.lock();
        let (mut state, _) = shared
          .condition
          .wait_timeout_while(state, shared.idle_timeout, |s| {
            !s.quit && s.queue.is_empty()
          })
          .unwrap_or_else(PoisonError::into_inner);

        match state.queue.pop_front() {
          Some(job) => {
            state.busy += 1;
            job
          }
          None => {
            state.live -= 1;
            if !state.quit {
              // 空闲超时退出，由后续操作回收句柄
              state.finished.push(thread::current().id());
              trace!("工作线程空闲超时退出，剩余线程数: {}", state.live);
            }
            return;
          }
        }
      };
      job(shared.as_ref());
    }
  }

  fn take_finished(state: &mut State) -> Vec<JoinHandle<()>> {
    let ids: Vec<ThreadId> = state.finished.drain(..).collect();
    ids
      .into_iter()
      .filter_map(|id| state.threads.remove(&id))
      .collect()
  }

  fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
      let _ = handle.join();
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.shutdown();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Instant;

  #[test]
  fn rejects_zero_workers() {
    assert!(matches!(
      WorkerPool::new(0, Duration::from_secs(1)),
      Err(PoolError::NoWorkers)
    ));
  }

  #[test]
  fn handles_return_task_results() {
    let pool = WorkerPool::new(2, Duration::from_secs(2)).unwrap();
    let handles: Vec<_> = (0..8).map(|i| pool.submit(move || i * i).unwrap()).collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
    assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
  }

  #[test]
  fn never_exceeds_max_workers() {
    let max = 3;
    let pool = WorkerPool::new(max, Duration::from_secs(2)).unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..max * 10)
      .map(|_| {
        let running = Arc::clone(&running);
        let observed = Arc::clone(&observed);
        pool
          .submit(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            observed.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2));
            running.fetch_sub(1, Ordering::SeqCst);
          })
          .unwrap()
      })
      .collect();

    for handle in handles {
      handle.wait().unwrap();
    }
    assert!(pool.peak_workers() <= max);
    assert!(observed.load(Ordering::SeqCst) <= max);
  }

  #[test]
  fn sequential_tasks_reuse_idle_worker() {
    let pool = WorkerPool::new(4, Duration::from_secs(2)).unwrap();
    for i in 0..20 {
      assert_eq!(pool.submit(move || i + 1).unwrap().wait().unwrap(), i + 1);
    }
    assert_eq!(pool.peak_workers(), 1);
    assert_eq!(pool.live_workers(), 1);
  }

  #[test]
  fn rejected_submission_returns_payload() {
    let pool = WorkerPool::new(1, Duration::from_secs(2)).unwrap();
    let handle = pool
      .submit_with(vec![1u8, 2, 3], |data: Vec<u8>| data.len())
      .unwrap();
    assert_eq!(handle.wait().unwrap(), 3);

    pool.shutdown();
    match pool.submit_with(vec![9u8; 4], |data: Vec<u8>| data.len()) {
      Err((PoolError::Closed, payload)) => assert_eq!(payload, vec![9u8; 4]),
      other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn panic_becomes_error_result() {
    let pool = WorkerPool::new(1, Duration::from_secs(2)).unwrap();
    let bad = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
    let good = pool.submit(|| 7u32).unwrap();
    match bad.wait() {
      Err(PoolError::Panicked(msg)) => assert!(msg.contains("boom")),
      other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert_eq!(good.wait().unwrap(), 7);
  }

  #[test]
  fn shutdown_drains_pending_tasks() {
    let pool = WorkerPool::new(2, Duration::from_secs(2)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..20)
      .map(|_| {
        let done = Arc::clone(&done);
        pool
          .submit(move || {
            thread::sleep(Duration::from_millis(1));
            done.fetch_add(1, Ordering::SeqCst);
          })
          .unwrap()
      })
      .collect();

    pool.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 20);
    for handle in handles {
      assert!(handle.try_wait().unwrap().is_ok());
    }
    assert!(matches!(pool.submit(|| ()), Err(PoolError::Closed)));
  }

  #[test]
  fn idle_workers_retire() {
    let pool = WorkerPool::new(4, Duration::from_millis(50)).unwrap();
    let handles: Vec<_> = (0..4)
      .map(|_| pool.submit(|| thread::sleep(Duration::from_millis(20))).unwrap())
      .collect();
    for handle in handles {
      handle.wait().unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.live_workers() > 0 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(pool.live_workers(), 0);

    // 线程全部退出后仍可继续提交
    assert_eq!(pool.submit(|| 3).unwrap().wait().unwrap(), 3);
  }

  #[test]
  fn try_wait_reports_not_ready() {
    let pool = WorkerPool::new(1, Duration::from_secs(2)).unwrap();
    let handle = pool
      .submit(|| thread::sleep(Duration::from_millis(100)))
      .unwrap();
    assert!(handle.try_wait().is_none());
    assert!(handle.wait_timeout(Duration::from_millis(1)).is_none());
    assert!(handle.wait_timeout(Duration::from_secs(5)).unwrap().is_ok());
  }
}
