// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/model_pool.rs - 多上下文模型池
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
  collections::VecDeque,
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  config::ScoreFilter,
  model::{DetectItem, EngineLoader, InferenceEngine},
  pool::{PoolError, TaskHandle, WorkerPool},
};

#[derive(Error, Debug)]
pub enum ModelPoolError {
  #[error("模型加载错误: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("工作线程 {worker} 初始化推理上下文失败: {source}")]
  EngineInit {
    worker: usize,
    source: Box<dyn std::error::Error + Send + Sync>,
  },
  #[error("线程池错误: {0}")]
  Pool(#[from] PoolError),
  #[error("分片 {index} 提交失败: {source}")]
  Rejected {
    index: usize,
    source: PoolError,
    input: Vec<u8>,
  },
  #[error("分片 {index} 推理失败: {reason}")]
  Inference {
    index: usize,
    reason: String,
    input: Vec<u8>,
  },
  #[error("没有等待中的推理任务")]
  Empty,
  #[error("等待推理结果超时")]
  Timeout,
}

impl ModelPoolError {
  /// 取回失败任务携带的输入缓冲
  pub fn take_input(&mut self) -> Option<Vec<u8>> {
    match self {
      ModelPoolError::Rejected { input, .. } | ModelPoolError::Inference { input, .. } => {
        Some(std::mem::take(input))
      }
      _ => None,
    }
  }
}

/// 提交给模型池的一个分片
///
/// `input` 的所有权在任务执行期间转移给模型池，并随结果一起归还。
#[derive(Debug)]
pub struct TileTask {
  pub index: usize,
  pub rotate: bool,
  pub input: Vec<u8>,
  pub filter: Arc<ScoreFilter>,
}

/// 单个分片的推理结果，坐标位于模型输入空间
#[derive(Debug)]
pub struct TileResult {
  pub index: usize,
  pub rotate: bool,
  pub worker: usize,
  pub items: Vec<DetectItem>,
  pub input: Vec<u8>,
}

type Outcome = Result<TileResult, ModelPoolError>;

struct Inflight {
  counter: u64,
  handles: VecDeque<TaskHandle<Outcome>>,
  abandoned: Vec<TaskHandle<Outcome>>,
}

/// N 个推理上下文加一个 N 线程的线程池
///
/// `put` 按提交计数轮询分配上下文；`get` 总是等待最早提交的任务，
/// 因此与 `put` 次数相同的 `get` 调用按提交顺序返回结果。
pub struct ModelPool<E: InferenceEngine> {
  pool: WorkerPool,
  engines: Vec<Arc<Mutex<E>>>,
  inflight: Mutex<Inflight>,
  input_size: (u32, u32),
  weights: Arc<[u8]>,
}

fn lock_engine<E>(engine: &Mutex<E>) -> MutexGuard<'_, E> {
  engine.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: InferenceEngine> ModelPool<E> {
  /// 读取模型文件并为每个工作线程创建独立的推理上下文
  pub fn init<L>(
    loader: &L,
    model_path: impl AsRef<Path>,
    workers: usize,
    idle_timeout: Duration,
  ) -> Result<Self, ModelPoolError>
  where
    L: EngineLoader<Engine = E>,
  {
    let model_path = model_path.as_ref();
    info!("加载模型文件: {}", model_path.display());
    let weights: Arc<[u8]> = std::fs::read(model_path)
      .inspect_err(|e| error!("读取模型文件失败: {}", e))?
      .into();
    Self::with_weights(loader, weights, workers, idle_timeout)
  }

  /// 使用已加载的模型数据创建模型池，所有上下文共享同一份权重
  pub fn with_weights<L>(
    loader: &L,
    weights: Arc<[u8]>,
    workers: usize,
    idle_timeout: Duration,
  ) -> Result<Self, ModelPoolError>
  where
    L: EngineLoader<Engine = E>,
  {
    let pool = WorkerPool::new(workers, idle_timeout)?;

    let mut engines = Vec::with_capacity(workers);
    for worker in 0..workers {
      let engine = loader
        .load(&weights, worker)
        .map_err(|e| ModelPoolError::EngineInit {
          worker,
          source: Box::new(e),
        })
        .inspect_err(|e| error!("{}", e))?;
      engines.push(Arc::new(Mutex::new(engine)));
    }

    let input_size = lock_engine(&engines[0]).input_size();
    info!(
      "模型池初始化完成: {} 个上下文, 模型输入 {}x{}",
      workers, input_size.0, input_size.1
    );

    Ok(ModelPool {
      pool,
      engines,
      inflight: Mutex::new(Inflight {
        counter: 0,
        handles: VecDeque::new(),
        abandoned: Vec::new(),
      }),
      input_size,
      weights,
    })
  }

  pub fn workers(&self) -> usize {
    self.engines.len()
  }

  /// 模型输入尺寸 (宽, 高)
  pub fn input_size(&self) -> (u32, u32) {
    self.input_size
  }

  pub fn weights(&self) -> &Arc<[u8]> {
    &self.weights
  }

  pub fn pending(&self) -> usize {
    self.lock_inflight().handles.len()
  }

  fn lock_inflight(&self) -> MutexGuard<'_, Inflight> {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn put(&self, task: TileTask) -> Result<(), ModelPoolError> {
    let mut inflight = self.lock_inflight();
    let worker = (inflight.counter % self.engines.len() as u64) as usize;
    let engine = Arc::clone(&self.engines[worker]);

    let handle = self
      .pool
      .submit_with(task, move |task: TileTask| -> Outcome {
        let TileTask {
          index,
          rotate,
          input,
          filter,
        } = task;
        let result = lock_engine(&engine).infer(&input, &filter);
        match result {
          Ok(result) => Ok(TileResult {
            index,
            rotate,
            worker,
            items: result.items.into_vec(),
            input,
          }),
          Err(e) => Err(ModelPoolError::Inference {
            index,
            reason: e.to_string(),
            input,
          }),
        }
      })
      .map_err(|(source, task)| ModelPoolError::Rejected {
        index: task.index,
        source,
        input: task.input,
      })?;

    inflight.counter += 1;
    inflight.handles.push_back(handle);
    debug!("分片任务已提交到上下文 {}", worker);
    Ok(())
  }

  /// 阻塞等待最早提交的任务
  pub fn get(&self) -> Result<TileResult, ModelPoolError> {
    let handle = self
      .lock_inflight()
      .handles
      .pop_front()
      .ok_or(ModelPoolError::Empty)?;
    handle.wait()?
  }

  /// 最多等待 `timeout`；超时后该任务仍保留在队首，可再次等待
  pub fn get_timeout(&self, timeout: Duration) -> Result<TileResult, ModelPoolError> {
    let mut inflight = self.lock_inflight();
    let outcome = inflight
      .handles
      .front()
      .ok_or(ModelPoolError::Empty)?
      .wait_timeout(timeout);
    match outcome {
      Some(outcome) => {
        inflight.handles.pop_front();
        outcome?
      }
      None => Err(ModelPoolError::Timeout),
    }
  }

  /// 放弃队首任务；任务完成后其结果被丢弃，输入缓冲可通过 [`Self::reclaim`] 取回
  pub fn abandon(&self) -> bool {
    let mut inflight = self.lock_inflight();
    match inflight.handles.pop_front() {
      Some(handle) => {
        inflight.abandoned.push(handle);
        warn!("放弃一个未完成的推理任务");
        true
      }
      None => false,
    }
  }

  /// 已放弃但尚未完成的任务数
  pub fn abandoned(&self) -> usize {
    self.lock_inflight().abandoned.len()
  }

  /// 取回已放弃且已完成的任务的输入缓冲
  pub fn reclaim(&self) -> Vec<Vec<u8>> {
    let mut inflight = self.lock_inflight();
    let mut buffers = Vec::new();
    inflight.abandoned.retain(|handle| match handle.try_wait() {
      None => true,
      Some(Ok(Ok(result))) => {
        buffers.push(result.input);
        false
      }
      Some(Ok(Err(mut e))) => {
        buffers.extend(e.take_input());
        false
      }
      Some(Err(_)) => false,
    });
    if !buffers.is_empty() {
      debug!("取回 {} 个已放弃任务的输入缓冲", buffers.len());
    }
    buffers
  }

  /// 等待所有未取回的任务后关闭线程池
  pub fn deinit(self) {
    drop(self);
  }
}

impl<E: InferenceEngine> Drop for ModelPool<E> {
  fn drop(&mut self) {
    let handles: Vec<_> = {
      let mut inflight = self.lock_inflight();
      let mut handles: Vec<_> = inflight.handles.drain(..).collect();
      handles.append(&mut inflight.abandoned);
      handles
    };
    if !handles.is_empty() {
      debug!("释放模型池前等待 {} 个未取回的任务", handles.len());
    }
    for handle in handles {
      let _ = handle.wait();
    }
    self.pool.shutdown();
    info!("模型池已释放");
  }
}
