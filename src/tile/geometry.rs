// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tile/geometry.rs - 分片几何变换与逆变换
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

use crate::{tile::TileOffset, transform::CropRequest};

pub const ALIGNMENT: usize = 16;

pub fn align16(value: usize) -> usize {
  (value + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// 分片从原图到模型输入的几何关系
///
/// 竖向分片 (宽 < 高) 先裁剪到 16 对齐的填充图，顺时针旋转 90° 后再缩放到模型输入；
/// 其余分片直接缩放。整帧检测时按模型输入比例居中填充后缩放 (letterbox)。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGeometry {
  pub crop_width: usize,
  pub crop_height: usize,
  pub fill_width: usize,
  pub fill_height: usize,
  /// 裁剪区域在填充图中的左上角
  pub pad_left: usize,
  pub pad_top: usize,
  pub model_width: usize,
  pub model_height: usize,
  pub rotate: bool,
}

impl TileGeometry {
  pub fn new(crop_width: usize, crop_height: usize, model_width: usize, model_height: usize) -> Self {
    let rotate = crop_width < crop_height;
    let (fill_width, fill_height) = if rotate {
      (align16(crop_width), align16(crop_height))
    } else {
      (crop_width, crop_height)
    };

    Self {
      crop_width,
      crop_height,
      fill_width,
      fill_height,
      pad_left: 0,
      pad_top: 0,
      model_width,
      model_height,
      rotate,
    }
  }

  /// 整帧检测：保持宽高比，填充到与模型输入相同的比例，原图居中
  pub fn letterbox(width: usize, height: usize, model_width: usize, model_height: usize) -> Self {
    // width / height 与 model_width / model_height 比较，决定在哪个方向填充
    let (fill_width, fill_height) = if width * model_height >= height * model_width {
      (width, (width * model_height).div_ceil(model_width).max(height))
    } else {
      ((height * model_width).div_ceil(model_height).max(width), height)
    };

    Self {
      crop_width: width,
      crop_height: height,
      fill_width,
      fill_height,
      pad_left: (fill_width - width) / 2,
      pad_top: (fill_height - height) / 2,
      model_width,
      model_height,
      rotate: false,
    }
  }

  /// 对齐填充量 (宽, 高)
  pub fn padding(&self) -> (usize, usize) {
    (
      align16(self.crop_width) - self.crop_width,
      align16(self.crop_height) - self.crop_height,
    )
  }

  pub fn crop_request(&self, offset: TileOffset) -> CropRequest {
    CropRequest {
      offset,
      crop_width: self.crop_width,
      crop_height: self.crop_height,
      fill_width: self.fill_width,
      fill_height: self.fill_height,
      pad_left: self.pad_left,
      pad_top: self.pad_top,
      dst_width: self.model_width,
      dst_height: self.model_height,
      rotate: self.rotate,
    }
  }

  /// 将模型输入空间中的框映射回原图坐标
  ///
  /// 缩放时下界取 floor、上界取 ceil；结果截断在分片范围内。
  pub fn restore(&self, bbox: [i32; 4], offset: TileOffset) -> [i32; 4] {
    let [x1, y1, x2, y2] = bbox.map(|v| v as f32);

    let (left, top, right, bottom) = if self.rotate {
      // 旋转后的填充图尺寸为 fill_height x fill_width
      let sx = self.fill_height as f32 / self.model_width as f32;
      let sy = self.fill_width as f32 / self.model_height as f32;
      let l = (x1 * sx).floor() as i32;
      let t = (y1 * sy).floor() as i32;
      let r = (x2 * sx).ceil() as i32;
      let b = (y2 * sy).ceil() as i32;

      // 撤销顺时针 90° 旋转: x = y', y = H - x'
      let h = self.fill_height as i32;
      (t, h - r, b, h - l)
    } else {
      let sx = self.fill_width as f32 / self.model_width as f32;
      let sy = self.fill_height as f32 / self.model_height as f32;
      (
        (x1 * sx).floor() as i32,
        (y1 * sy).floor() as i32,
        (x2 * sx).ceil() as i32,
        (y2 * sy).ceil() as i32,
      )
    };

    let (px, py) = (self.pad_left as i32, self.pad_top as i32);
    let (cw, ch) = (self.crop_width as i32, self.crop_height as i32);
    let (ox, oy) = (offset.col as i32, offset.row as i32);
    [
      (left - px).clamp(0, cw) + ox,
      (top - py).clamp(0, ch) + oy,
      (right - px).clamp(0, cw) + ox,
      (bottom - py).clamp(0, ch) + oy,
    ]
  }

  /// 将分片局部坐标中的框映射到模型输入空间，即 [`Self::restore`] 的正向过程
  pub fn project(&self, bbox: [i32; 4]) -> [i32; 4] {
    let [l, t, r, b] = bbox.map(|v| v as f32);
    let (px, py) = (self.pad_left as f32, self.pad_top as f32);
    let (l, t, r, b) = (l + px, t + py, r + px, b + py);

    let (x1, y1, x2, y2, sx, sy) = if self.rotate {
      let h = self.fill_height as f32;
      (
        h - b,
        l,
        h - t,
        r,
        self.model_width as f32 / self.fill_height as f32,
        self.model_height as f32 / self.fill_width as f32,
      )
    } else {
      (
        l,
        t,
        r,
        b,
        self.model_width as f32 / self.fill_width as f32,
        self.model_height as f32 / self.fill_height as f32,
      )
    };

    [
      (x1 * sx).round() as i32,
      (y1 * sy).round() as i32,
      (x2 * sx).round() as i32,
      (y2 * sy).round() as i32,
    ]
  }
}
