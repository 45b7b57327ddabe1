// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 分片检测配置
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

use std::{path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::COCO_LABELS};

const DEFAULT_WORKERS: usize = 3;
const DEFAULT_TILE_WIDTH: usize = 640;
const DEFAULT_TILE_HEIGHT: usize = 1080;
const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_COLLECT_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
  #[error("参数 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
}

/// 置信度过滤条件
///
/// 全局阈值作为基础过滤，按类别的阈值列表在其上进一步筛选。
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreFilter {
  pub class_num: usize,
  pub threshold: f32,
  pub per_class: Vec<f32>,
}

impl Default for ScoreFilter {
  fn default() -> Self {
    Self {
      class_num: COCO_LABELS.len(),
      threshold: DEFAULT_THRESHOLD,
      per_class: Vec::new(),
    }
  }
}

impl ScoreFilter {
  pub fn accepts(&self, class_id: u32, score: f32) -> bool {
    let class_id = class_id as usize;
    if class_id >= self.class_num || score < self.threshold {
      return false;
    }
    self
      .per_class
      .get(class_id)
      .is_none_or(|threshold| score >= *threshold)
  }
}

/// 检测方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectMode {
  /// 按分片尺寸切分后并行推理
  #[default]
  Tile,
  /// 整帧按比例居中填充后一次推理，不分片
  Letterbox,
}

impl FromStr for DetectMode {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "tile" => Ok(DetectMode::Tile),
      "letterbox" => Ok(DetectMode::Letterbox),
      _ => Err(()),
    }
  }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
  pub model_path: PathBuf,
  pub workers: usize,
  pub mode: DetectMode,
  pub tile_width: usize,
  pub tile_height: usize,
  pub filter: ScoreFilter,
  pub labels: Vec<String>,
  pub font_path: Option<PathBuf>,
  /// 单次等待分片结果的超时
  pub collect_timeout: Duration,
  /// 超时后对同一分片的重试次数
  pub collect_retries: u32,
  /// 空闲工作线程的退出超时
  pub idle_timeout: Duration,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      model_path: PathBuf::new(),
      workers: DEFAULT_WORKERS,
      mode: DetectMode::default(),
      tile_width: DEFAULT_TILE_WIDTH,
      tile_height: DEFAULT_TILE_HEIGHT,
      filter: ScoreFilter::default(),
      labels: COCO_LABELS.iter().map(|s| s.to_string()).collect(),
      font_path: None,
      collect_timeout: DEFAULT_COLLECT_TIMEOUT,
      collect_retries: DEFAULT_COLLECT_RETRIES,
      idle_timeout: DEFAULT_IDLE_TIMEOUT,
    }
  }
}

impl DetectorConfig {
  pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.model_path = path.into();
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_mode(mut self, mode: DetectMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_tile_size(mut self, width: usize, height: usize) -> Self {
    self.tile_width = width;
    self.tile_height = height;
    self
  }

  pub fn with_filter(mut self, filter: ScoreFilter) -> Self {
    self.filter = filter;
    self
  }

  pub fn with_labels(mut self, labels: Vec<String>) -> Self {
    self.labels = labels;
    self
  }

  pub fn with_collect_timeout(mut self, timeout: Duration, retries: u32) -> Self {
    self.collect_timeout = timeout;
    self.collect_retries = retries;
    self
  }

  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = timeout;
    self
  }

  pub fn label(&self, class_id: u32) -> String {
    self
      .labels
      .get(class_id as usize)
      .cloned()
      .unwrap_or_else(|| format!("class-{}", class_id))
  }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
  value.trim().parse().map_err(|_| ConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  })
}

fn parse_size(key: &str, value: &str) -> Result<(usize, usize), ConfigError> {
  let (w, h) = value
    .split_once(['x', 'X'])
    .ok_or_else(|| ConfigError::InvalidValue {
      key: key.to_string(),
      value: value.to_string(),
    })?;
  Ok((parse_value(key, w)?, parse_value(key, h)?))
}

impl FromUrlWithScheme for DetectorConfig {
  const SCHEME: &'static str = "tile";
}

impl FromUrl for DetectorConfig {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME.to_string(),
        actual: url.scheme().to_string(),
      });
    }

    let mut config = DetectorConfig::default().with_model_path(url.path());
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "workers" => config.workers = parse_value(&key, &value)?,
        "mode" => config.mode = parse_value(&key, &value)?,
        "tile" => {
          let (w, h) = parse_size(&key, &value)?;
          config.tile_width = w;
          config.tile_height = h;
        }
        "threshold" => config.filter.threshold = parse_value(&key, &value)?,
        "thresholds" => {
          config.filter.per_class = value
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_value(&key, s))
            .collect::<Result<_, _>>()?;
        }
        "classes" => config.filter.class_num = parse_value(&key, &value)?,
        "font" => config.font_path = Some(PathBuf::from(value.as_ref())),
        "timeout_ms" => {
          config.collect_timeout = Duration::from_millis(parse_value(&key, &value)?)
        }
        "retries" => config.collect_retries = parse_value(&key, &value)?,
        "idle_ms" => config.idle_timeout = Duration::from_millis(parse_value(&key, &value)?),
        other => warn!("忽略未知的配置项: {}={}", other, value),
      }
    }

    if config.workers == 0 {
      return Err(ConfigError::InvalidValue {
        key: "workers".to_string(),
        value: "0".to_string(),
      });
    }
    if config.tile_width == 0 || config.tile_height == 0 {
      return Err(ConfigError::InvalidValue {
        key: "tile".to_string(),
        value: format!("{}x{}", config.tile_width, config.tile_height),
      });
    }

    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn filter_uses_global_then_per_class() {
    let filter = ScoreFilter {
      class_num: 3,
      threshold: 0.3,
      per_class: vec![0.5, 0.2],
    };
    assert!(filter.accepts(0, 0.6));
    assert!(!filter.accepts(0, 0.4));
    // 全局阈值优先于更低的类别阈值
    assert!(!filter.accepts(1, 0.25));
    assert!(filter.accepts(1, 0.35));
    assert!(filter.accepts(2, 0.31));
    assert!(!filter.accepts(3, 0.99));
  }

  #[test]
  fn config_from_url() {
    let url = Url::parse(
      "tile:///opt/models/yolo.rknn?workers=4&tile=640x1080&threshold=0.1&thresholds=0.5,0.55&classes=8&timeout_ms=250&retries=2",
    )
    .unwrap();
    let config = DetectorConfig::from_url(&url).unwrap();
    assert_eq!(config.model_path, PathBuf::from("/opt/models/yolo.rknn"));
    assert_eq!(config.workers, 4);
    assert_eq!(config.mode, DetectMode::Tile);
    assert_eq!((config.tile_width, config.tile_height), (640, 1080));
    assert_eq!(config.filter.threshold, 0.1);
    assert_eq!(config.filter.per_class, vec![0.5, 0.55]);
    assert_eq!(config.filter.class_num, 8);
    assert_eq!(config.collect_timeout, Duration::from_millis(250));
    assert_eq!(config.collect_retries, 2);
  }

  #[test]
  fn config_from_url_rejects_bad_values() {
    let wrong_scheme = Url::parse("image:///a.rknn").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&wrong_scheme),
      Err(ConfigError::SchemeMismatch { .. })
    ));

    let bad_tile = Url::parse("tile:///a.rknn?tile=640").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&bad_tile),
      Err(ConfigError::InvalidValue { .. })
    ));

    let bad_mode = Url::parse("tile:///a.rknn?mode=mosaic").unwrap();
    assert!(matches!(
      DetectorConfig::from_url(&bad_mode),
      Err(ConfigError::InvalidValue { .. })
    ));

    let letterbox = Url::parse("tile:///a.rknn?mode=letterbox").unwrap();
    assert_eq!(
      DetectorConfig::from_url(&letterbox).unwrap().mode,
      DetectMode::Letterbox
    );

    let no_workers = Url::parse("tile:///a.rknn?workers=0").unwrap();
    assert!(DetectorConfig::from_url(&no_workers).is_err());
  }

  #[test]
  fn label_falls_back_to_class_id() {
    let config = DetectorConfig::default().with_labels(vec!["car".to_string()]);
    assert_eq!(config.label(0), "car");
    assert_eq!(config.label(5), "class-5");
  }
}
