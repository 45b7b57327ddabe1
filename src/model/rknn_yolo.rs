// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn_yolo.rs - 基于 RKNPU 的 YOLO 推理上下文
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

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  config::ScoreFilter,
  model::{DetectItem, DetectResult, EngineLoader, InferenceEngine},
};

const YOLO_NUM_INPUTS: u32 = 1;
const YOLO_NUM_OUTPUTS: u32 = 6;
const YOLO_STRIDES: [u32; 3] = [8, 16, 32];
const YOLO_DEFAULT_INPUT: (u32, u32) = (640, 640);

#[derive(Error, Debug)]
pub enum RknnYoloError {
  #[error("模型无效: {0}, 错误: {1}")]
  ModelInvalid(String, rknpu::Error),
  #[error("RKNN 错误: {0}")]
  RknnError(rknpu::Error),
  #[error("输入长度不匹配: 期望 {expected}, 实际 {actual}")]
  InputSize { expected: usize, actual: usize },
}

impl From<rknpu::Error> for RknnYoloError {
  fn from(err: rknpu::Error) -> Self {
    RknnYoloError::RknnError(err)
  }
}

impl RknnYoloError {
  pub fn invalid(msg: &str, e: rknpu::Error) -> Self {
    RknnYoloError::ModelInvalid(msg.to_string(), e)
  }
}

/// 单个 NPU 执行上下文
pub struct RknnYolo {
  context: Context,
  input_width: u32,
  input_height: u32,
  worker: usize,
}

// SAFETY: 模型池通过互斥锁保证同一上下文不会被两个线程同时访问，
// RKNN 上下文本身不绑定创建它的线程。
unsafe impl Send for RknnYolo {}

/// 按工作线程构建 [`RknnYolo`]
#[derive(Debug, Clone)]
pub struct RknnYoloLoader {
  input_width: u32,
  input_height: u32,
}

impl Default for RknnYoloLoader {
  fn default() -> Self {
    Self {
      input_width: YOLO_DEFAULT_INPUT.0,
      input_height: YOLO_DEFAULT_INPUT.1,
    }
  }
}

impl RknnYoloLoader {
  pub fn input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }
}

impl EngineLoader for RknnYoloLoader {
  type Engine = RknnYolo;
  type Error = RknnYoloError;

  fn load(&self, weights: &Arc<[u8]>, worker: usize) -> Result<RknnYolo, RknnYoloError> {
    debug!(
      "工作线程 {}: 模型数据大小 {:.2} MB",
      worker,
      weights.len() as f64 / (1024.0 * 1024.0)
    );

    info!("工作线程 {}: 创建 RKNN 推理上下文", worker);
    let context = Context::new(weights.as_ref(), InitFlags::default())?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(RknnYoloError::invalid("无法查询 SDK 版本", e));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| RknnYoloError::invalid("无法获取输入数量", e))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| RknnYoloError::invalid("无法获取输出数量", e))?;

    if num_inputs != YOLO_NUM_INPUTS || num_outputs != YOLO_NUM_OUTPUTS {
      let msg = format!(
        "预期模型输入/输出数量为 {}/{}, 实际为 {}/{}",
        YOLO_NUM_INPUTS, YOLO_NUM_OUTPUTS, num_inputs, num_outputs
      );
      error!("{}", msg);
      return Err(RknnYoloError::invalid(&msg, rknpu::Error::InvalidModel));
    }

    Ok(RknnYolo {
      context,
      input_width: self.input_width,
      input_height: self.input_height,
      worker,
    })
  }
}

/// 根据张量大小匹配回归和分类输出
fn match_reg_cls_tensors<'a>(
  tensor1: &'a [f32],
  tensor2: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if tensor1.len() == reg_expected && tensor2.len() == cls_expected {
    Some((tensor1, tensor2))
  } else if tensor1.len() == cls_expected && tensor2.len() == reg_expected {
    Some((tensor2, tensor1))
  } else {
    None
  }
}

impl RknnYolo {
  fn decode(&self, output: &rknpu::Output, filter: &ScoreFilter) -> Vec<DetectItem> {
    let (in_w, in_h) = (self.input_width as f32, self.input_height as f32);
    let mut items = Vec::new();

    for (head_idx, stride) in YOLO_STRIDES.into_iter().enumerate() {
      let map_h = (self.input_height / stride) as usize;
      let map_w = (self.input_width / stride) as usize;
      let spatial = map_h * map_w;
      let reg_expected = 4 * spatial;
      let cls_expected = filter.class_num * spatial;

      let (tensor1, tensor2) = match (output.get_f32(head_idx * 2), output.get_f32(head_idx * 2 + 1)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => {
          error!("检测头 {}: 获取输出失败: {}", head_idx, e);
          continue;
        }
      };

      // RKNN 输出顺序可能不同，按张量大小区分回归与分类
      let Some((reg, cls)) = match_reg_cls_tensors(tensor1, tensor2, reg_expected, cls_expected)
      else {
        error!(
          "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
          head_idx,
          tensor1.len(),
          tensor2.len(),
          reg_expected,
          cls_expected
        );
        continue;
      };

      let stride = stride as f32;
      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let mut max_logit = f32::MIN;
          let mut class_id = 0usize;
          for c in 0..filter.class_num {
            let logit = cls[c * spatial + idx];
            if logit > max_logit {
              max_logit = logit;
              class_id = c;
            }
          }
          let score = sigmoid(max_logit);
          if !filter.accepts(class_id as u32, score) {
            continue;
          }

          let grid_x = (w as f32) + 0.5;
          let grid_y = (h as f32) + 0.5;
          let left = ((grid_x - reg[idx]) * stride).clamp(0.0, in_w);
          let top = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, in_h);
          let right = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, in_w);
          let bottom = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, in_h);

          items.push(DetectItem {
            class_id: class_id as u32,
            score,
            bbox: [
              left.floor() as i32,
              top.floor() as i32,
              right.ceil() as i32,
              bottom.ceil() as i32,
            ],
          });
        }
      }
    }

    items
  }
}

impl InferenceEngine for RknnYolo {
  type Error = RknnYoloError;

  fn input_size(&self) -> (u32, u32) {
    (self.input_width, self.input_height)
  }

  fn infer(&mut self, input: &[u8], filter: &ScoreFilter) -> Result<DetectResult, Self::Error> {
    let expected = (self.input_width * self.input_height * 3) as usize;
    if input.len() != expected {
      return Err(RknnYoloError::InputSize {
        expected,
        actual: input.len(),
      });
    }

    self
      .context
      .set_input(0, input, TensorFormat::NHWC, TensorType::UInt8)?;
    self.context.run()?;
    let output = self.context.get_outputs()?;

    let items = self.decode(&output, filter);
    debug!("工作线程 {}: 检测到 {} 个物体", self.worker, items.len());
    Ok(DetectResult::from(items))
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
