// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detector.rs - 分片检测调度
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

use std::{sync::Arc, time::Instant};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  config::{DetectMode, DetectorConfig, ScoreFilter},
  frame::{FrameError, RgbFrame},
  model::{DetectItem, EngineLoader, InferenceEngine},
  output::draw::{Draw, DrawError},
  pool::{ModelPool, ModelPoolError, TileResult, TileTask},
  tile::{TileGeometry, TileLayout},
  transform::{ImageTransform, TransformError},
};

mod result;
pub use self::result::{AggregatedResult, CycleStats};

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("帧错误: {0}")]
  Frame(#[from] FrameError),
  #[error("模型池错误: {0}")]
  ModelPool(#[from] ModelPoolError),
  #[error("绘制器初始化失败: {0}")]
  Draw(#[from] DrawError),
  #[error("无效的分片尺寸: {width}x{height}")]
  InvalidTileSize { width: usize, height: usize },
}

/// 单个分片的失败原因，仅记录日志，不中断检测周期
#[derive(Error, Debug)]
pub enum TileError {
  #[error("分片 {index} 裁剪失败: {source}")]
  Transform {
    index: usize,
    source: TransformError,
  },
  #[error("分片 {index} 提交失败: {source}")]
  Dispatch {
    index: usize,
    source: ModelPoolError,
  },
  #[error("分片 {index} 推理失败: {source}")]
  Inference {
    index: usize,
    source: ModelPoolError,
  },
  #[error("分片 {index} 在 {retries} 次重试后仍未完成，已放弃")]
  Abandoned { index: usize, retries: u32 },
}

impl TileError {
  fn take_input(&mut self) -> Option<Vec<u8>> {
    match self {
      TileError::Dispatch { source, .. } | TileError::Inference { source, .. } => {
        source.take_input()
      }
      _ => None,
    }
  }
}

/// 逐帧检测的统一接口
pub trait Detector {
  type Error;
  fn detect_image(&mut self, image: &RgbImage) -> Result<&AggregatedResult, Self::Error>;
}

/// 大图分片检测器
///
/// 每帧按分片布局裁剪出若干子图，提交到模型池并行推理，
/// 按提交顺序取回结果后映射回原图坐标并合并。重叠区域的目标不去重。
/// 同一实例不可重入，帧缓冲、分片缓冲与结果在各帧之间复用。
pub struct TileDetector<E: InferenceEngine, T: ImageTransform> {
  config: DetectorConfig,
  filter: Arc<ScoreFilter>,
  pool: ModelPool<E>,
  transform: T,
  draw: Draw,
  frame: RgbFrame,
  layout: TileLayout,
  buffers: Vec<Vec<u8>>,
  dispatched: Vec<usize>,
  merged: Vec<DetectItem>,
  result: AggregatedResult,
  stats: CycleStats,
}

impl<E: InferenceEngine, T: ImageTransform> TileDetector<E, T> {
  /// 读取模型文件并创建模型池
  pub fn new<L>(config: DetectorConfig, loader: &L, transform: T) -> Result<Self, DetectError>
  where
    L: EngineLoader<Engine = E>,
  {
    let pool = ModelPool::init(
      loader,
      &config.model_path,
      config.workers,
      config.idle_timeout,
    )?;
    Self::with_pool(config, pool, transform)
  }

  pub fn with_pool(
    config: DetectorConfig,
    pool: ModelPool<E>,
    transform: T,
  ) -> Result<Self, DetectError> {
    if config.tile_width == 0 || config.tile_height == 0 {
      return Err(DetectError::InvalidTileSize {
        width: config.tile_width,
        height: config.tile_height,
      });
    }
    let draw = Draw::from_font_path(config.font_path.as_deref())?;
    info!(
      "分片检测器初始化: 分片 {}x{}, {} 个推理上下文",
      config.tile_width,
      config.tile_height,
      pool.workers()
    );

    Ok(Self {
      filter: Arc::new(config.filter.clone()),
      config,
      pool,
      transform,
      draw,
      frame: RgbFrame::default(),
      layout: TileLayout::default(),
      buffers: Vec::new(),
      dispatched: Vec::new(),
      merged: Vec::new(),
      result: AggregatedResult::default(),
      stats: CycleStats::default(),
    })
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn pool(&self) -> &ModelPool<E> {
    &self.pool
  }

  /// 最近一次发布的结果
  pub fn result(&self) -> &AggregatedResult {
    &self.result
  }

  pub fn last_stats(&self) -> CycleStats {
    self.stats
  }

  /// 空闲的分片输入缓冲数
  pub fn spare_buffers(&self) -> usize {
    self.buffers.len()
  }

  /// 下一帧起生效
  pub fn set_threshold(&mut self, threshold: f32) {
    self.config.filter.threshold = threshold;
    self.refresh_filter();
  }

  pub fn set_threshold_list(&mut self, thresholds: Vec<f32>) {
    self.config.filter.per_class = thresholds;
    self.refresh_filter();
  }

  pub fn set_class_num(&mut self, class_num: usize) {
    self.config.filter.class_num = class_num;
    self.refresh_filter();
  }

  pub fn set_tile_size(&mut self, width: usize, height: usize) -> Result<(), DetectError> {
    if width == 0 || height == 0 {
      return Err(DetectError::InvalidTileSize { width, height });
    }
    self.config.tile_width = width;
    self.config.tile_height = height;
    Ok(())
  }

  pub fn set_mode(&mut self, mode: DetectMode) {
    self.config.mode = mode;
  }

  fn refresh_filter(&mut self) {
    self.filter = Arc::new(self.config.filter.clone());
    debug!("检测阈值已更新: {:?}", self.filter);
  }

  /// 检测一帧紧凑排列的 RGB888 数据
  pub fn try_detect(
    &mut self,
    data: &[u8],
    width: usize,
    height: usize,
  ) -> Result<&AggregatedResult, DetectError> {
    self.run_cycle(data, width, height)?;
    Ok(&self.result)
  }

  /// 与 [`Self::try_detect`] 相同，但出错时记录日志并返回上一次的结果
  pub fn detect(&mut self, data: &[u8], width: usize, height: usize) -> &AggregatedResult {
    if let Err(e) = self.run_cycle(data, width, height) {
      warn!("检测失败，沿用上一帧结果: {}", e);
    }
    &self.result
  }

  pub fn detect_image(&mut self, image: &RgbImage) -> Result<&AggregatedResult, DetectError> {
    let (width, height) = image.dimensions();
    self.try_detect(image.as_raw(), width as usize, height as usize)
  }

  fn run_cycle(&mut self, data: &[u8], width: usize, height: usize) -> Result<(), DetectError> {
    let start = Instant::now();
    self.frame.ingest(data, width, height)?;

    let (model_w, model_h) = self.pool.input_size();
    let (model_w, model_h) = (model_w as usize, model_h as usize);
    let (geometry, tile_w, tile_h) = match self.config.mode {
      DetectMode::Tile => {
        let (tile_w, tile_h) = (self.config.tile_width, self.config.tile_height);
        let geometry = TileGeometry::new(tile_w.min(width), tile_h.min(height), model_w, model_h);
        (geometry, tile_w, tile_h)
      }
      DetectMode::Letterbox => (
        TileGeometry::letterbox(width, height, model_w, model_h),
        width,
        height,
      ),
    };
    let offsets = self.layout.offsets(width, height, tile_w, tile_h);
    let filter = Arc::clone(&self.filter);
    self.buffers.extend(self.pool.reclaim());

    // 分发
    let mut failed = 0;
    self.dispatched.clear();
    for (index, offset) in offsets.iter().enumerate() {
      let request = geometry.crop_request(*offset);
      let mut input = self
        .buffers
        .pop()
        .unwrap_or_else(|| Vec::with_capacity(request.dst_size()));
      if let Err(source) = self
        .transform
        .crop_resize_rotate(&self.frame, &request, &mut input)
      {
        warn!("{}", TileError::Transform { index, source });
        self.buffers.push(input);
        failed += 1;
        continue;
      }

      let task = TileTask {
        index,
        rotate: geometry.rotate,
        input,
        filter: Arc::clone(&filter),
      };
      match self.pool.put(task) {
        Ok(()) => self.dispatched.push(index),
        Err(source) => {
          let mut e = TileError::Dispatch { index, source };
          self.buffers.extend(e.take_input());
          warn!("{}", e);
          failed += 1;
        }
      }
    }

    // 按提交顺序收集，每次 put 对应一次 get
    self.merged.clear();
    for &expected in &self.dispatched {
      let result = match collect_one(&self.pool, &self.config, expected) {
        Ok(result) => result,
        Err(mut e) => {
          self.buffers.extend(e.take_input());
          warn!("{}", e);
          failed += 1;
          continue;
        }
      };

      let TileResult {
        index,
        rotate,
        worker,
        items,
        input,
      } = result;
      self.buffers.push(input);
      if index != expected {
        warn!("分片结果顺序错乱: 期望 {}, 实际 {}", expected, index);
      }
      let Some(offset) = offsets.get(index) else {
        warn!("分片序号 {} 超出布局范围", index);
        failed += 1;
        continue;
      };
      debug!(
        "分片 {} (上下文 {}, 旋转 {}) 检测到 {} 个目标",
        index,
        worker,
        rotate,
        items.len()
      );
      self.merged.extend(items.into_iter().map(|item| DetectItem {
        bbox: geometry.restore(item.bbox, *offset),
        ..item
      }));
    }

    // 发布
    self.result.frame_mut().copy_from(&self.frame)?;
    self.result.publish(&self.merged);
    let config = &self.config;
    self
      .draw
      .draw_detections(self.result.frame_mut(), &self.merged, |id| config.label(id));

    self.stats = CycleStats {
      tiles: offsets.len(),
      failed_tiles: failed,
      detections: self.merged.len(),
      elapsed: start.elapsed(),
    };
    debug!(
      "检测完成: {} 个分片 ({} 个失败), {} 个目标, 耗时 {:.2?}",
      self.stats.tiles, self.stats.failed_tiles, self.stats.detections, self.stats.elapsed
    );
    Ok(())
  }
}

/// 取回队首任务的结果；超时后在同一位置重试，超过重试次数则放弃该任务
fn collect_one<E: InferenceEngine>(
  pool: &ModelPool<E>,
  config: &DetectorConfig,
  index: usize,
) -> Result<TileResult, TileError> {
  let mut retries = 0;
  loop {
    match pool.get_timeout(config.collect_timeout) {
      Ok(result) => return Ok(result),
      Err(ModelPoolError::Timeout) if retries < config.collect_retries => {
        retries += 1;
        debug!("等待分片 {} 超时，第 {} 次重试", index, retries);
      }
      Err(ModelPoolError::Timeout) => {
        pool.abandon();
        return Err(TileError::Abandoned { index, retries });
      }
      Err(source) => return Err(TileError::Inference { index, source }),
    }
  }
}

impl<E: InferenceEngine, T: ImageTransform> Detector for TileDetector<E, T> {
  type Error = DetectError;

  fn detect_image(&mut self, image: &RgbImage) -> Result<&AggregatedResult, Self::Error> {
    TileDetector::detect_image(self, image)
  }
}
