// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 线程池与模型池
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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
  #[error("线程池最大线程数必须大于 0")]
  NoWorkers,
  #[error("无法创建工作线程: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("线程池已关闭")]
  Closed,
  #[error("任务执行时发生 panic: {0}")]
  Panicked(String),
  #[error("任务在完成前被丢弃")]
  Cancelled,
}

mod worker_pool;
pub use self::worker_pool::{TaskHandle, WorkerPool};

mod model_pool;
pub use self::model_pool::{ModelPool, ModelPoolError, TileResult, TileTask};
