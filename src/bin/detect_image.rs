// 该文件是 Poubelle 项目的一部分。
// src/bin/detect_image.rs - 单张图像检测
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use poubelle::{
  FromUrl,
  input::ImageFileInput,
  model::{LabelClassifier, ReplayDetector},
  output::{SaveImageFileOutput, draw::Draw},
  task::{ImageTask, Task},
};

/// 图像检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像，例如 image:///path/to/bin.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 检测器，例如 replay:///path/to/detections.jsonl
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Url,
  /// 标注后的图像，例如 image:///path/to/annotated.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 标签字体文件（TTF/OTF），不设置时只绘制边框
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 表示空垃圾桶的标签关键字
  #[arg(long, value_delimiter = ',', default_value = "vide,empty")]
  pub empty_keywords: Vec<String>,
  /// 表示满垃圾桶的标签关键字
  #[arg(long, value_delimiter = ',', default_value = "pleine,full")]
  pub full_keywords: Vec<String>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("检测器: {}", args.detector);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let detector = ReplayDetector::from_url(&args.detector)?;
  let output = SaveImageFileOutput::from_url(&args.output)?;

  let classifier = LabelClassifier::new(&args.empty_keywords, &args.full_keywords);
  let mut draw = Draw::default().with_classifier(classifier.clone());
  if let Some(font) = &args.font {
    draw = draw.with_font_file(font)?;
  }

  let report = ImageTask::default()
    .with_classifier(classifier)
    .with_draw(draw)
    .run_task(input, detector, output)?;

  for classified in &report.detections {
    info!(
      "{} ({:.2}) -> {}",
      classified.detection.label, classified.detection.confidence, classified.state
    );
  }
  for verdict in report.verdicts() {
    println!("{}", verdict);
  }

  Ok(())
}
