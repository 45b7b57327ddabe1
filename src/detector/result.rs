// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detector/result.rs - 合并后的检测结果
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

use std::time::Duration;

use crate::{frame::RgbFrame, model::DetectItem};

/// 一帧的检测结果：原图坐标中的全部目标与标注后的帧
///
/// 类别、边框、置信度以平行数组的形式存放，边框每个目标 4 个整数。
/// 各缓冲只在数量增长时重新分配。
#[derive(Debug, Clone, Default)]
pub struct AggregatedResult {
  frame: RgbFrame,
  items: Vec<DetectItem>,
  classes: Vec<u32>,
  boxes: Vec<i32>,
  scores: Vec<f32>,
}

impl AggregatedResult {
  pub fn width(&self) -> usize {
    self.frame.width()
  }

  pub fn height(&self) -> usize {
    self.frame.height()
  }

  /// 标注后的帧
  pub fn frame(&self) -> &RgbFrame {
    &self.frame
  }

  pub fn detect_num(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn classes(&self) -> &[u32] {
    &self.classes
  }

  /// `[left, top, right, bottom]` 依次排列
  pub fn boxes(&self) -> &[i32] {
    &self.boxes
  }

  pub fn scores(&self) -> &[f32] {
    &self.scores
  }

  pub fn items(&self) -> impl ExactSizeIterator<Item = &DetectItem> {
    self.items.iter()
  }

  pub(crate) fn frame_mut(&mut self) -> &mut RgbFrame {
    &mut self.frame
  }

  pub(crate) fn publish(&mut self, items: &[DetectItem]) {
    self.items.clear();
    self.classes.clear();
    self.boxes.clear();
    self.scores.clear();

    self.items.extend_from_slice(items);
    for item in items {
      self.classes.push(item.class_id);
      self.boxes.extend_from_slice(&item.bbox);
      self.scores.push(item.score);
    }
  }
}

/// 单次检测周期的统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CycleStats {
  pub tiles: usize,
  pub failed_tiles: usize,
  pub detections: usize,
  pub elapsed: Duration,
}
