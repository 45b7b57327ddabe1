// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;
use tracing::info;

use crate::{frame::RgbFrame, model::DetectItem};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const TEXT_COLOR: [u8; 3] = [255, 255, 255];
const BOX_THICKNESS: i32 = 2;

/// 未配置字体时依次尝试的系统字体
pub const SYSTEM_FONT_PATHS: &[&str] = &[
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
  "/usr/share/fonts/truetype/noto/NotoSans-Regular.ttf",
];

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("读取字体文件失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("无效的字体文件: {0}")]
  InvalidFont(#[from] ab_glyph::InvalidFont),
}

/// 在帧上绘制检测框与标签
///
/// 未加载字体时只绘制边框。
pub struct Draw {
  font_size: f32,
  font: Option<FontVec>,
  label_color: [u8; 3],
  text_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      font: None,
      label_color: LABEL_COLOR,
      text_color: TEXT_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let font = FontVec::try_from_vec(data)?;
    info!("加载标签字体: {}", path.display());
    Ok(Self {
      font: Some(font),
      ..Self::default()
    })
  }

  pub fn from_font_path(path: Option<&Path>) -> Result<Self, DrawError> {
    match path {
      Some(path) => Self::with_font_file(path),
      None => {
        info!("未配置标签字体，只绘制检测框");
        Ok(Self::default())
      }
    }
  }

  /// 候选路径中第一个存在的字体文件
  pub fn find_font<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    for candidate in candidates {
      let path: &Path = candidate.as_ref();
      if path.is_file() {
        return Some(path.to_path_buf());
      }
    }
    None
  }

  pub fn system_font() -> Option<PathBuf> {
    Self::find_font(SYSTEM_FONT_PATHS)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 标签文本，如 `person 87.5%`
  pub fn label_text(label: &str, score: f32) -> String {
    format!("{} {:.1}%", label, score * 100.0)
  }

  pub fn draw_detections<L>(&self, frame: &mut RgbFrame, items: &[DetectItem], label: L)
  where
    L: Fn(u32) -> String,
  {
    let (w, h) = (frame.width() as i32, frame.height() as i32);
    let Some(mut image) = frame.as_image_mut() else {
      return;
    };
    let color = Rgb(self.label_color);

    for item in items {
      let [left, top, right, bottom] = item.bbox;
      let x_min = left.clamp(0, w - 1);
      let y_min = top.clamp(0, h - 1);
      let x_max = right.clamp(0, w - 1);
      let y_max = bottom.clamp(0, h - 1);
      if x_min >= x_max || y_min >= y_max {
        continue;
      }

      // 加粗为 2 像素
      for t in 0..BOX_THICKNESS {
        let width = x_max - x_min - 2 * t;
        let height = y_max - y_min - 2 * t;
        if width <= 0 || height <= 0 {
          break;
        }
        let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
        draw_hollow_rect_mut(&mut image, rect, color);
      }

      let Some(font) = &self.font else {
        continue;
      };
      let text = Self::label_text(&label(item.class_id), item.score);
      let scale = PxScale::from(self.font_size);
      let (text_w, text_h) = text_size(scale, font, &text);
      let tag_h = text_h as i32 + 2 * LABEL_TEXT_VERTICAL_PADDING;
      // 标签放在边框上方，空间不足时放在框内
      let tag_y = if y_min >= tag_h { y_min - tag_h } else { y_min };
      let tag_w = (text_w as i32).min(w - x_min);
      if tag_w <= 0 {
        continue;
      }

      let rect = Rect::at(x_min, tag_y).of_size(tag_w as u32, tag_h as u32);
      draw_filled_rect_mut(&mut image, rect, color);
      draw_text_mut(
        &mut image,
        Rgb(self.text_color),
        x_min,
        tag_y + LABEL_TEXT_VERTICAL_PADDING,
        scale,
        font,
        &text,
      );
    }
  }
}
