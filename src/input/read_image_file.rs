// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::{collections::VecDeque, path::PathBuf};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemaMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("目录中没有图像文件: {0}")]
  NoImages(String),
}

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 从单个图像文件或目录中按文件名顺序读取图像
///
/// 无法解码的文件会被跳过。
pub struct ImageFileInput {
  paths: VecDeque<PathBuf>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = PathBuf::from(url.path());
    if !path.is_dir() {
      // 文件不存在时直接报告 I/O 错误
      std::fs::metadata(&path)?;
      return Ok(ImageFileInput {
        paths: VecDeque::from([path]),
      });
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(&path)? {
      let entry = entry?.path();
      let is_image = entry
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
      if entry.is_file() && is_image {
        paths.push(entry);
      }
    }
    if paths.is_empty() {
      return Err(ImageFileInputError::NoImages(path.display().to_string()));
    }
    paths.sort();
    info!("从目录 {} 读取 {} 张图像", path.display(), paths.len());

    Ok(ImageFileInput {
      paths: paths.into(),
    })
  }
}

impl ImageFileInput {
  pub fn remaining(&self) -> usize {
    self.paths.len()
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbImage;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(path) = self.paths.pop_front() {
      match ImageReader::open(&path).and_then(|r| r.with_guessed_format()) {
        Ok(reader) => match reader.decode() {
          Ok(image) => return Some(image.into_rgb8()),
          Err(e) => warn!("解码图像 {} 失败: {}", path.display(), e),
        },
        Err(e) => warn!("打开图像 {} 失败: {}", path.display(), e),
      }
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reads_directory_in_name_order() {
    let dir = std::env::temp_dir().join(format!("shanan-tile-input-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    RgbImage::new(3, 2).save(dir.join("b.png")).unwrap();
    RgbImage::new(5, 4).save(dir.join("a.png")).unwrap();
    std::fs::write(dir.join("c.png"), b"not an image").unwrap();
    std::fs::write(dir.join("notes.txt"), b"skip").unwrap();

    let url = Url::parse(&format!("image://{}", dir.display())).unwrap();
    let input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.remaining(), 3);
    let sizes: Vec<_> = input.map(|image| image.dimensions()).collect();
    assert_eq!(sizes, vec![(5, 4), (3, 2)]);
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn missing_file_is_an_error() {
    let url = Url::parse("image:///nonexistent/frame.png").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&url),
      Err(ImageFileInputError::IoError(_))
    ));
  }
}
