// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/tile_pipeline.rs - 分片检测流程集成测试
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
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::Duration,
};

use image::{RgbImage, imageops::FilterType};
use shanan_tile::{
  config::{DetectMode, DetectorConfig, ScoreFilter},
  detector::{AggregatedResult, DetectError, TileDetector},
  frame::RgbFrame,
  model::{DetectItem, DetectResult, EngineLoader, InferenceEngine},
  output::Render,
  pool::ModelPool,
  task::{OneShotTask, Task},
  transform::CpuTransform,
};

const RED: [u8; 3] = [255, 0, 0];
const BLUE: [u8; 3] = [0, 0, 255];
const BACKGROUND: [u8; 3] = [10, 10, 10];

#[derive(Debug, thiserror::Error)]
#[error("模拟推理失败")]
struct MockError;

/// 在模型输入中寻找红色像素块并报告其外接框
struct BlobEngine {
  size: (u32, u32),
}

impl InferenceEngine for BlobEngine {
  type Error = MockError;

  fn input_size(&self) -> (u32, u32) {
    self.size
  }

  fn infer(&mut self, input: &[u8], filter: &ScoreFilter) -> Result<DetectResult, MockError> {
    let (w, h) = (self.size.0 as usize, self.size.1 as usize);
    if input.len() != w * h * 3 {
      return Err(MockError);
    }

    let mut bbox: Option<[i32; 4]> = None;
    for y in 0..h {
      for x in 0..w {
        let idx = (y * w + x) * 3;
        if input[idx..idx + 3] == RED {
          let (x, y) = (x as i32, y as i32);
          bbox = Some(match bbox {
            None => [x, y, x + 1, y + 1],
            Some([l, t, r, b]) => [l.min(x), t.min(y), r.max(x + 1), b.max(y + 1)],
          });
        }
      }
    }

    let items = bbox
      .filter(|_| filter.accepts(0, 0.9))
      .map(|bbox| DetectItem {
        class_id: 0,
        score: 0.9,
        bbox,
      })
      .into_iter()
      .collect::<Vec<_>>();
    Ok(items.into())
  }
}

struct BlobLoader {
  size: (u32, u32),
}

impl EngineLoader for BlobLoader {
  type Engine = BlobEngine;
  type Error = MockError;

  fn load(&self, _weights: &Arc<[u8]>, _worker: usize) -> Result<BlobEngine, MockError> {
    Ok(BlobEngine { size: self.size })
  }
}

/// 以分片左上角像素的红色分量作为类别，按上下文和类别制造不同延迟
struct MarkerEngine {
  worker: usize,
  fail_on: Option<u32>,
  stall_on: Option<u32>,
  stalled: Arc<AtomicBool>,
}

impl InferenceEngine for MarkerEngine {
  type Error = MockError;

  fn input_size(&self) -> (u32, u32) {
    (64, 64)
  }

  fn infer(&mut self, input: &[u8], filter: &ScoreFilter) -> Result<DetectResult, MockError> {
    let marker = input[0] as u32;
    if self.fail_on == Some(marker) {
      return Err(MockError);
    }
    // 只卡住一次
    if self.stall_on == Some(marker) && !self.stalled.swap(true, Ordering::SeqCst) {
      thread::sleep(Duration::from_millis(300));
    } else {
      let delay = (self.worker as u64 * 7 + marker as u64 * 3) % 4;
      thread::sleep(Duration::from_millis(delay * 5));
    }

    let score = 0.6 + marker as f32 * 0.1;
    let items = if filter.accepts(marker, score) {
      vec![DetectItem {
        class_id: marker,
        score,
        bbox: [0, 0, 1, 1],
      }]
    } else {
      Vec::new()
    };
    Ok(items.into())
  }
}

#[derive(Default)]
struct MarkerLoader {
  fail_on: Option<u32>,
  stall_on: Option<u32>,
  stalled: Arc<AtomicBool>,
}

impl EngineLoader for MarkerLoader {
  type Engine = MarkerEngine;
  type Error = MockError;

  fn load(&self, _weights: &Arc<[u8]>, worker: usize) -> Result<MarkerEngine, MockError> {
    Ok(MarkerEngine {
      worker,
      fail_on: self.fail_on,
      stall_on: self.stall_on,
      stalled: Arc::clone(&self.stalled),
    })
  }
}

fn weights() -> Arc<[u8]> {
  Arc::from(vec![0u8; 16])
}

fn frame_with_rects(width: usize, height: usize, rects: &[[usize; 4]]) -> Vec<u8> {
  let mut data = Vec::with_capacity(width * height * 3);
  for y in 0..height {
    for x in 0..width {
      let inside = rects
        .iter()
        .any(|&[l, t, r, b]| x >= l && x < r && y >= t && y < b);
      data.extend_from_slice(if inside { &RED } else { &BACKGROUND });
    }
  }
  data
}

/// 4 个 64x64 分片横向排列，每个分片左上角像素记录分片序号
fn marker_frame() -> Vec<u8> {
  let (width, height) = (256, 64);
  let mut data = vec![0u8; width * height * 3];
  for tile in 0..4 {
    data[tile * 64 * 3] = tile as u8;
  }
  data
}

fn blob_detector(
  tile: (usize, usize),
  model: (u32, u32),
) -> TileDetector<BlobEngine, CpuTransform> {
  let config = DetectorConfig::default()
    .with_workers(2)
    .with_tile_size(tile.0, tile.1);
  blob_detector_with(config, model)
}

fn blob_detector_with(
  config: DetectorConfig,
  model: (u32, u32),
) -> TileDetector<BlobEngine, CpuTransform> {
  let pool = ModelPool::with_weights(
    &BlobLoader { size: model },
    weights(),
    config.workers,
    config.idle_timeout,
  )
  .unwrap();
  TileDetector::with_pool(config, pool, CpuTransform::new(FilterType::Nearest)).unwrap()
}

fn marker_detector(
  loader: MarkerLoader,
  config: DetectorConfig,
) -> TileDetector<MarkerEngine, CpuTransform> {
  let pool =
    ModelPool::with_weights(&loader, weights(), config.workers, config.idle_timeout).unwrap();
  TileDetector::with_pool(config, pool, CpuTransform::new(FilterType::Nearest)).unwrap()
}

fn marker_config() -> DetectorConfig {
  DetectorConfig::default()
    .with_workers(3)
    .with_tile_size(64, 64)
}

fn boxes(result: &AggregatedResult) -> Vec<[i32; 4]> {
  result.items().map(|item| item.bbox).collect()
}

#[test]
fn rotated_tiles_map_back_to_source() {
  // 64x108 的竖向分片需要旋转，填充到 64x112，模型输入即旋转后的 112x64
  let mut detector = blob_detector((64, 108), (112, 64));
  let data = frame_with_rects(192, 108, &[[70, 30, 90, 50]]);

  let result = detector.try_detect(&data, 192, 108).unwrap();
  assert_eq!(boxes(result), vec![[70, 30, 90, 50]]);
  assert_eq!(result.classes(), &[0]);
  assert_eq!(result.boxes(), &[70, 30, 90, 50]);
  assert_eq!((result.width(), result.height()), (192, 108));
  // 标注帧在框的左上角绘制了蓝色边框
  assert_eq!(result.frame().pixel(70, 30), Some(BLUE));
  assert_eq!(result.frame().pixel(0, 0), Some(BACKGROUND));

  let stats = detector.last_stats();
  assert_eq!(stats.tiles, 3);
  assert_eq!(stats.failed_tiles, 0);
  assert_eq!(stats.detections, 1);
}

#[test]
fn unrotated_rows_map_back_to_source() {
  // 两行分片，偏移 0 和 44
  let mut detector = blob_detector((192, 64), (192, 64));
  let data = frame_with_rects(192, 108, &[[10, 80, 40, 100]]);

  let result = detector.try_detect(&data, 192, 108).unwrap();
  assert_eq!(boxes(result), vec![[10, 80, 40, 100]]);
  assert_eq!(detector.last_stats().tiles, 2);
}

#[test]
fn resized_tiles_stay_within_scale_tolerance() {
  // 模型输入为分片的一半，最近邻缩放后每个模型像素对应 2 个原图像素
  let mut detector = blob_detector((192, 64), (96, 32));
  let data = frame_with_rects(192, 108, &[[10, 80, 40, 100]]);

  let result = detector.try_detect(&data, 192, 108).unwrap();
  let found = boxes(result);
  assert_eq!(found.len(), 1);
  for (got, want) in found[0].iter().zip([10, 80, 40, 100]) {
    assert!((got - want).abs() <= 2, "{:?}", found[0]);
  }
}

#[test]
fn letterbox_mode_detects_whole_frame_once() {
  let config = DetectorConfig::default()
    .with_workers(2)
    .with_mode(DetectMode::Letterbox);
  // 192x108 居中填充到 192x192，再缩小到 64x64
  let mut detector = blob_detector_with(config, (64, 64));
  let data = frame_with_rects(192, 108, &[[70, 30, 90, 50]]);

  let result = detector.try_detect(&data, 192, 108).unwrap();
  let found = boxes(result);
  assert_eq!(found.len(), 1);
  for (got, want) in found[0].iter().zip([70, 30, 90, 50]) {
    assert!((got - want).abs() <= 3, "{:?}", found[0]);
  }
  assert_eq!(detector.last_stats().tiles, 1);

  detector.set_mode(DetectMode::Tile);
  detector.set_tile_size(64, 108).unwrap();
  detector.try_detect(&data, 192, 108).unwrap();
  assert_eq!(detector.last_stats().tiles, 3);
}

#[test]
fn overlapping_detections_are_not_merged() {
  // 目标位于两行分片的重叠带 (44..64) 内
  let mut detector = blob_detector((192, 64), (192, 64));
  let data = frame_with_rects(192, 108, &[[100, 50, 120, 60]]);

  let result = detector.try_detect(&data, 192, 108).unwrap();
  assert_eq!(boxes(result), vec![[100, 50, 120, 60], [100, 50, 120, 60]]);
}

#[test]
fn results_follow_tile_order_under_variable_latency() {
  let mut detector = marker_detector(MarkerLoader::default(), marker_config());
  let data = marker_frame();

  for _ in 0..5 {
    let result = detector.try_detect(&data, 256, 64).unwrap();
    assert_eq!(result.classes(), &[0, 1, 2, 3]);
    assert_eq!(
      boxes(result),
      vec![[0, 0, 1, 1], [64, 0, 65, 1], [128, 0, 129, 1], [192, 0, 193, 1]]
    );
  }
  assert_eq!(detector.pool().pending(), 0);
}

#[test]
fn failed_tile_contributes_nothing() {
  let loader = MarkerLoader {
    fail_on: Some(2),
    ..MarkerLoader::default()
  };
  let mut detector = marker_detector(loader, marker_config());

  let result = detector.try_detect(&marker_frame(), 256, 64).unwrap();
  assert_eq!(result.classes(), &[0, 1, 3]);
  let stats = detector.last_stats();
  assert_eq!(stats.tiles, 4);
  assert_eq!(stats.failed_tiles, 1);
  assert_eq!(stats.detections, 3);
  // 失败分片的输入缓冲同样归还复用
  assert_eq!(detector.spare_buffers(), 4);
}

#[test]
fn stalled_tile_is_abandoned_without_breaking_order() {
  let loader = MarkerLoader {
    stall_on: Some(1),
    ..MarkerLoader::default()
  };
  let config = marker_config().with_collect_timeout(Duration::from_millis(50), 1);
  let mut detector = marker_detector(loader, config);
  let data = marker_frame();

  let result = detector.try_detect(&data, 256, 64).unwrap();
  assert_eq!(result.classes(), &[0, 2, 3]);
  assert_eq!(
    boxes(result),
    vec![[0, 0, 1, 1], [128, 0, 129, 1], [192, 0, 193, 1]]
  );
  assert_eq!(detector.last_stats().failed_tiles, 1);
  assert_eq!(detector.pool().pending(), 0);

  // 被放弃的任务完成后不会混入下一帧
  thread::sleep(Duration::from_millis(400));
  let result = detector.try_detect(&data, 256, 64).unwrap();
  assert_eq!(result.classes(), &[0, 1, 2, 3]);
  assert_eq!(detector.last_stats().failed_tiles, 0);
  // 被放弃任务的输入缓冲在下一帧取回
  assert_eq!(detector.spare_buffers(), 4);
  assert_eq!(detector.pool().abandoned(), 0);
}

#[test]
fn invalid_input_keeps_previous_result() {
  let mut detector = marker_detector(MarkerLoader::default(), marker_config());
  detector.try_detect(&marker_frame(), 256, 64).unwrap();

  assert!(matches!(
    detector.try_detect(&[], 0, 64),
    Err(DetectError::Frame(_))
  ));
  assert!(matches!(
    detector.try_detect(&[0u8; 10], 256, 64),
    Err(DetectError::Frame(_))
  ));
  let stale = detector.detect(&[], 0, 0);
  assert_eq!(stale.detect_num(), 4);
  assert_eq!((stale.width(), stale.height()), (256, 64));
}

#[test]
fn threshold_changes_apply_to_next_cycle() {
  let mut detector = marker_detector(MarkerLoader::default(), marker_config());
  let data = marker_frame();
  // 各分片置信度依次为 0.6 0.7 0.8 0.9
  assert_eq!(detector.try_detect(&data, 256, 64).unwrap().detect_num(), 4);

  detector.set_threshold(0.75);
  assert_eq!(detector.try_detect(&data, 256, 64).unwrap().classes(), &[2, 3]);

  detector.set_threshold(0.5);
  detector.set_threshold_list(vec![0.5, 0.95]);
  assert_eq!(
    detector.try_detect(&data, 256, 64).unwrap().classes(),
    &[0, 2, 3]
  );

  detector.set_class_num(2);
  assert_eq!(detector.try_detect(&data, 256, 64).unwrap().classes(), &[0]);
}

#[test]
fn tile_size_change_recomputes_layout() {
  let mut detector = marker_detector(MarkerLoader::default(), marker_config());
  let data = marker_frame();
  detector.try_detect(&data, 256, 64).unwrap();
  assert_eq!(detector.last_stats().tiles, 4);

  assert!(matches!(
    detector.set_tile_size(0, 64),
    Err(DetectError::InvalidTileSize { .. })
  ));
  detector.set_tile_size(128, 64).unwrap();
  detector.try_detect(&data, 256, 64).unwrap();
  assert_eq!(detector.last_stats().tiles, 2);
}

#[derive(Default)]
struct Recorder {
  seen: Mutex<Vec<(usize, usize, usize)>>,
}

impl Render<RgbFrame, AggregatedResult> for &Recorder {
  type Error = MockError;

  fn render_result(&self, frame: &RgbFrame, result: &AggregatedResult) -> Result<(), MockError> {
    self
      .seen
      .lock()
      .unwrap()
      .push((frame.width(), frame.height(), result.detect_num()));
    Ok(())
  }
}

#[test]
fn one_shot_task_renders_annotated_frame() {
  let detector = blob_detector((64, 108), (112, 64));
  let data = frame_with_rects(192, 108, &[[70, 30, 90, 50]]);
  let image = RgbImage::from_raw(192, 108, data).unwrap();

  let recorder = Recorder::default();
  OneShotTask
    .run_task(vec![image].into_iter(), detector, &recorder)
    .unwrap();
  assert_eq!(*recorder.seen.lock().unwrap(), vec![(192, 108, 1)]);
}
