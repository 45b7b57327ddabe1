// 该文件是 Shanan （山南西风） 项目的一部分。
// src/transform.rs - 分片裁剪、旋转与缩放
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

use image::{
  Rgb, RgbImage,
  imageops::{self, FilterType},
};
use thiserror::Error;

use crate::{
  frame::{RGB_CHANNELS, RgbFrame},
  tile::TileOffset,
};

/// 填充区域使用的灰度值
pub const FILL_VALUE: u8 = 0x80;

#[derive(Error, Debug)]
pub enum TransformError {
  #[error("裁剪区域超出原图: ({x} {y} {width} {height}) / ({src_width} {src_height})")]
  OutOfBounds {
    x: usize,
    y: usize,
    width: usize,
    height: usize,
    src_width: usize,
    src_height: usize,
  },
  #[error("无效的变换参数: {0}")]
  InvalidRequest(String),
  #[error("原图缓冲与尺寸不符")]
  InvalidFrame,
}

/// 一次裁剪-填充-旋转-缩放操作的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRequest {
  pub offset: TileOffset,
  pub crop_width: usize,
  pub crop_height: usize,
  pub fill_width: usize,
  pub fill_height: usize,
  /// 裁剪区域在填充图中的左上角，分片时为 (0, 0)，整帧填充时居中
  pub pad_left: usize,
  pub pad_top: usize,
  pub dst_width: usize,
  pub dst_height: usize,
  pub rotate: bool,
}

impl CropRequest {
  fn validate(&self, src: &RgbFrame) -> Result<(), TransformError> {
    if self.crop_width == 0 || self.crop_height == 0 {
      return Err(TransformError::InvalidRequest("裁剪尺寸为 0".to_string()));
    }
    if self.dst_width == 0 || self.dst_height == 0 {
      return Err(TransformError::InvalidRequest("输出尺寸为 0".to_string()));
    }
    if self.fill_width < self.pad_left + self.crop_width
      || self.fill_height < self.pad_top + self.crop_height
    {
      return Err(TransformError::InvalidRequest(format!(
        "填充尺寸 {}x{} 放不下位于 ({}, {}) 的 {}x{} 裁剪区域",
        self.fill_width,
        self.fill_height,
        self.pad_left,
        self.pad_top,
        self.crop_width,
        self.crop_height
      )));
    }
    if self.offset.col + self.crop_width > src.width()
      || self.offset.row + self.crop_height > src.height()
    {
      return Err(TransformError::OutOfBounds {
        x: self.offset.col,
        y: self.offset.row,
        width: self.crop_width,
        height: self.crop_height,
        src_width: src.width(),
        src_height: src.height(),
      });
    }
    Ok(())
  }

  /// 输出缓冲的字节数
  pub fn dst_size(&self) -> usize {
    self.dst_width * self.dst_height * 3
  }
}

/// 图像变换后端
///
/// 输出写入调用者持有的缓冲，缓冲在多次调用间复用。
pub trait ImageTransform: Send + Sync {
  fn crop_resize_rotate(
    &self,
    src: &RgbFrame,
    req: &CropRequest,
    dst: &mut Vec<u8>,
  ) -> Result<(), TransformError>;
}

/// 基于 `image` 的 CPU 实现
#[derive(Debug, Clone, Copy)]
pub struct CpuTransform {
  filter: FilterType,
}

impl Default for CpuTransform {
  fn default() -> Self {
    Self {
      filter: FilterType::Triangle,
    }
  }
}

impl CpuTransform {
  pub fn new(filter: FilterType) -> Self {
    Self { filter }
  }
}

impl ImageTransform for CpuTransform {
  fn crop_resize_rotate(
    &self,
    src: &RgbFrame,
    req: &CropRequest,
    dst: &mut Vec<u8>,
  ) -> Result<(), TransformError> {
    req.validate(src)?;
    let bytes = src.as_bytes();
    if bytes.len() < src.size() {
      return Err(TransformError::InvalidFrame);
    }

    let covered = req.fill_width == req.crop_width && req.fill_height == req.crop_height;
    let (fill_width, fill_height) = (req.fill_width as u32, req.fill_height as u32);
    let mut filled = if covered {
      RgbImage::new(fill_width, fill_height)
    } else {
      RgbImage::from_pixel(fill_width, fill_height, Rgb([FILL_VALUE; 3]))
    };

    // 原图为紧凑排列的 RGB888，逐行拷贝裁剪区域
    let src_stride = src.width() * RGB_CHANNELS;
    let dst_stride = req.fill_width * RGB_CHANNELS;
    let row_bytes = req.crop_width * RGB_CHANNELS;
    let canvas: &mut [u8] = &mut filled;
    for y in 0..req.crop_height {
      let from = (req.offset.row + y) * src_stride + req.offset.col * RGB_CHANNELS;
      let to = (req.pad_top + y) * dst_stride + req.pad_left * RGB_CHANNELS;
      canvas[to..to + row_bytes].copy_from_slice(&bytes[from..from + row_bytes]);
    }

    let oriented = if req.rotate {
      imageops::rotate90(&filled)
    } else {
      filled
    };

    let (dst_width, dst_height) = (req.dst_width as u32, req.dst_height as u32);
    let resized = if oriented.dimensions() == (dst_width, dst_height) {
      oriented
    } else {
      imageops::resize(&oriented, dst_width, dst_height, self.filter)
    };

    dst.clear();
    dst.extend_from_slice(resized.as_raw());
    Ok(())
  }
}
