// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - RGB 帧缓冲定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("帧尺寸无效: {width}x{height}")]
  InvalidShape { width: usize, height: usize },
  #[error("帧数据长度不足: 期望 {expected}, 实际 {actual}")]
  ShortBuffer { expected: usize, actual: usize },
  #[error("帧缓冲分配失败: {0}")]
  Allocation(#[from] std::collections::TryReserveError),
}

/// 紧凑排列的 RGB888 帧缓冲
///
/// 缓冲在多次调用之间复用，仅当字节数增长时才重新分配。
#[derive(Debug, Clone, Default)]
pub struct RgbFrame {
  data: Vec<u8>,
  width: usize,
  height: usize,
  reallocations: usize,
}

impl RgbFrame {
  pub fn with_shape(width: usize, height: usize) -> Self {
    Self {
      data: vec![0u8; width * height * RGB_CHANNELS],
      width,
      height,
      reallocations: 1,
    }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn size(&self) -> usize {
    self.width * self.height * RGB_CHANNELS
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }

  pub fn capacity(&self) -> usize {
    self.data.capacity()
  }

  /// 底层存储被重新分配的次数
  pub fn reallocations(&self) -> usize {
    self.reallocations
  }

  /// 将外部原始数据复制进帧缓冲
  pub fn ingest(&mut self, src: &[u8], width: usize, height: usize) -> Result<(), FrameError> {
    if width == 0 || height == 0 {
      return Err(FrameError::InvalidShape { width, height });
    }
    let expected = width * height * RGB_CHANNELS;
    if src.len() < expected {
      return Err(FrameError::ShortBuffer {
        expected,
        actual: src.len(),
      });
    }

    self.reshape(width, height)?;
    self.data.copy_from_slice(&src[..expected]);
    Ok(())
  }

  /// 复制另一帧的内容，沿用相同的缓冲复用策略
  pub fn copy_from(&mut self, other: &RgbFrame) -> Result<(), FrameError> {
    self.reshape(other.width, other.height)?;
    self.data.copy_from_slice(&other.data);
    Ok(())
  }

  fn reshape(&mut self, width: usize, height: usize) -> Result<(), FrameError> {
    let size = width * height * RGB_CHANNELS;
    if size > self.data.capacity() {
      self
        .data
        .try_reserve_exact(size - self.data.len())?;
      self.reallocations += 1;
    }
    self.data.resize(size, 0);
    self.width = width;
    self.height = height;
    Ok(())
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.data
  }

  /// 可绘制的图像视图，不复制像素
  pub fn as_image_mut(&mut self) -> Option<ImageBuffer<Rgb<u8>, &mut [u8]>> {
    ImageBuffer::from_raw(self.width as u32, self.height as u32, self.data.as_mut_slice())
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    RgbImage::from_raw(self.width as u32, self.height as u32, self.data.clone())
      .unwrap_or_else(|| RgbImage::new(self.width as u32, self.height as u32))
  }

  pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
    if x >= self.width || y >= self.height {
      return None;
    }
    let idx = (y * self.width + x) * RGB_CHANNELS;
    Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
  }
}

impl AsRef<[u8]> for RgbFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for RgbFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl From<RgbImage> for RgbFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      data: image.into_raw(),
      width: width as usize,
      height: height as usize,
      reallocations: 1,
    }
  }
}
