// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 分片检测主程序
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_tile::{
  FromUrl,
  config::DetectorConfig,
  detector::TileDetector,
  input::InputWrapper,
  model::RknnYoloLoader,
  output::{OutputWrapper, draw::Draw},
  task::{ContinuousTask, Task},
  transform::CpuTransform,
};

/// 大分辨率图像分片检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测配置，如 tile:///path/model.rknn?workers=3&tile=640x1080
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 模型输入宽度
  #[arg(long, default_value_t = 640)]
  pub model_width: u32,
  /// 模型输入高度
  #[arg(long, default_value_t = 640)]
  pub model_height: u32,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测配置: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut config = DetectorConfig::from_url(&args.model)?;
  if config.font_path.is_none() {
    config.font_path = Draw::system_font();
  }
  let loader = RknnYoloLoader::default().input_size(args.model_width, args.model_height);
  let detector = TileDetector::new(config, &loader, CpuTransform::default())?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .run_task(input, detector, output)?;

  Ok(())
}
