// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 推理引擎定义
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

use std::sync::Arc;

use crate::config::ScoreFilter;

/// 单个检测目标，bbox 为模型输入空间的像素坐标
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [i32; 4], // [left, top, right, bottom]
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 一个工作线程独占的推理上下文
///
/// 输入为 `input_size()` 尺寸的 NHWC RGB 字节；阈值过滤和 NMS 等后处理在引擎内部完成。
pub trait InferenceEngine: Send + 'static {
  type Error: std::error::Error + Send + Sync + 'static;

  /// 模型输入尺寸 (宽, 高)
  fn input_size(&self) -> (u32, u32);

  fn infer(&mut self, input: &[u8], filter: &ScoreFilter) -> Result<DetectResult, Self::Error>;
}

/// 为模型池中的每个工作线程构建推理上下文
///
/// 权重只读取一次并在所有上下文之间共享，每个上下文拥有独立的执行状态。
pub trait EngineLoader {
  type Engine: InferenceEngine;
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(&self, weights: &Arc<[u8]>, worker: usize) -> Result<Self::Engine, Self::Error>;
}

/// COCO 数据集类别名称
pub const COCO_LABELS: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

#[cfg(feature = "rknpu")]
mod rknn_yolo;
#[cfg(feature = "rknpu")]
pub use self::rknn_yolo::{RknnYolo, RknnYoloError, RknnYoloLoader};
