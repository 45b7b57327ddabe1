// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tile.rs - 分片划分
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

use tracing::info;

mod geometry;
pub use self::geometry::{ALIGNMENT, TileGeometry, align16};

/// 分片左上角在原图中的像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileOffset {
  pub row: usize,
  pub col: usize,
}

impl TileOffset {
  pub fn new(row: usize, col: usize) -> Self {
    Self { row, col }
  }
}

/// 单个方向上的分片起点：等距重叠，最后一片贴齐边缘
fn axis_offsets(src: usize, tile: usize) -> Vec<usize> {
  let count = src.div_ceil(tile);
  let pad = if count > 1 {
    (count * tile - src) / (count - 1)
  } else {
    0
  };
  let step = tile - pad;
  let last = src - tile;

  (0..count)
    .map(|i| if i + 1 == count { last } else { (i * step).min(last) })
    .collect()
}

/// 计算覆盖整幅图像的分片偏移，按行优先顺序输出
///
/// 分片尺寸大于原图时按原图尺寸截断，此时只输出 (0, 0) 一个分片。
pub fn partition(
  src_width: usize,
  src_height: usize,
  tile_width: usize,
  tile_height: usize,
) -> Vec<TileOffset> {
  if src_width == 0 || src_height == 0 || tile_width == 0 || tile_height == 0 {
    return Vec::new();
  }

  let cols = axis_offsets(src_width, tile_width.min(src_width));
  let rows = axis_offsets(src_height, tile_height.min(src_height));

  rows
    .iter()
    .flat_map(|&row| cols.iter().map(move |&col| TileOffset { row, col }))
    .collect()
}

type LayoutKey = (usize, usize, usize, usize);

/// 缓存分片偏移，仅当原图或分片尺寸变化时重新计算
#[derive(Debug, Default)]
pub struct TileLayout {
  key: Option<LayoutKey>,
  offsets: Vec<TileOffset>,
  recomputed: usize,
}

impl TileLayout {
  pub fn offsets(
    &mut self,
    src_width: usize,
    src_height: usize,
    tile_width: usize,
    tile_height: usize,
  ) -> &[TileOffset] {
    let key = (src_width, src_height, tile_width, tile_height);
    if self.key != Some(key) {
      self.offsets = partition(src_width, src_height, tile_width, tile_height);
      self.key = Some(key);
      self.recomputed += 1;
      info!(
        "分片布局: ({} {}) -> ({} {}) * {}",
        src_width,
        src_height,
        tile_width,
        tile_height,
        self.offsets.len()
      );
    }
    &self.offsets
  }

  /// 布局被重新计算的次数
  pub fn recomputed(&self) -> usize {
    self.recomputed
  }

  pub fn len(&self) -> usize {
    self.offsets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.offsets.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn assert_covers(src_w: usize, src_h: usize, tile_w: usize, tile_h: usize) {
    let offsets = partition(src_w, src_h, tile_w, tile_h);
    assert!(!offsets.is_empty());
    let mut covered = vec![false; src_w * src_h];
    for o in &offsets {
      assert!(o.col + tile_w <= src_w, "{:?} 超出右边界", o);
      assert!(o.row + tile_h <= src_h, "{:?} 超出下边界", o);
      for y in o.row..o.row + tile_h {
        for x in o.col..o.col + tile_w {
          covered[y * src_w + x] = true;
        }
      }
    }
    assert!(
      covered.iter().all(|c| *c),
      "{}x{} / {}x{} 未完全覆盖",
      src_w,
      src_h,
      tile_w,
      tile_h
    );
  }

  #[test]
  fn exact_columns() {
    let offsets = partition(1920, 1080, 640, 1080);
    let cols: Vec<_> = offsets.iter().map(|o| o.col).collect();
    assert_eq!(cols, vec![0, 640, 1280]);
    assert!(offsets.iter().all(|o| o.row == 0));
  }

  #[test]
  fn overlapping_rows_flush_to_bottom() {
    let offsets = partition(1920, 1080, 1920, 640);
    assert_eq!(offsets, vec![TileOffset::new(0, 0), TileOffset::new(440, 0)]);
  }

  #[test]
  fn single_tile_when_tile_is_larger() {
    assert_eq!(partition(320, 240, 640, 640), vec![TileOffset::new(0, 0)]);
    assert_eq!(partition(640, 640, 640, 640), vec![TileOffset::new(0, 0)]);
  }

  #[test]
  fn row_major_order() {
    let offsets = partition(1000, 700, 400, 300);
    assert_eq!(offsets.len(), 3 * 3);
    for pair in offsets.windows(2) {
      let (a, b) = (pair[0], pair[1]);
      assert!(a.row < b.row || (a.row == b.row && a.col < b.col));
    }
  }

  #[test]
  fn steps_are_even_except_last() {
    for (src, tile) in [(1000usize, 300usize), (1921, 640), (2000, 333), (5000, 640)] {
      let cols: Vec<_> = partition(src, 10, tile, 10).iter().map(|o| o.col).collect();
      assert!(cols.len() > 1);
      let steps: Vec<_> = cols.windows(2).map(|w| w[1] - w[0]).collect();
      let (last, rest) = steps.split_last().unwrap();
      assert!(rest.iter().all(|s| *s == steps[0]), "{:?}", steps);
      assert!(*last <= steps[0]);
      assert_eq!(*cols.last().unwrap(), src - tile);
    }
  }

  #[test]
  fn coverage_on_varied_shapes() {
    for &(sw, sh, tw, th) in &[
      (64, 36, 16, 16),
      (100, 37, 33, 10),
      (97, 97, 32, 45),
      (50, 50, 50, 7),
      (31, 29, 3, 5),
      (16, 16, 16, 16),
    ] {
      assert_covers(sw, sh, tw, th);
    }
  }

  #[test]
  fn partition_is_deterministic() {
    assert_eq!(partition(1937, 1091, 640, 640), partition(1937, 1091, 640, 640));
  }

  #[test]
  fn layout_recomputes_only_on_change() {
    let mut layout = TileLayout::default();
    assert_eq!(layout.offsets(1920, 1080, 640, 1080).len(), 3);
    layout.offsets(1920, 1080, 640, 1080);
    assert_eq!(layout.recomputed(), 1);
    assert_eq!(layout.offsets(1920, 1080, 1920, 640).len(), 2);
    assert_eq!(layout.recomputed(), 2);
  }
}
