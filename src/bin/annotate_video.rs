// 该文件是 Poubelle 项目的一部分。
// src/bin/annotate_video.rs - 视频标注
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

use std::{
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use poubelle::{
  FromUrl,
  input::GStreamerInputPipelineBuilder,
  model::ReplayDetector,
  output::{EncoderConfig, GStreamerVideoOutput, draw::Draw, record::DetectionRecord},
  task::{AnnotateTask, Progress, Task},
};

/// 视频标注参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入视频，例如 gst://file/path/to/input.mp4?rotate=90
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 检测器，例如 replay:///path/to/detections.jsonl?confidence=0.25
  #[arg(long, value_name = "DETECTOR")]
  pub detector: Url,
  /// 输出视频，例如 video:///path/to/output.webm?fallback=avi
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 逐帧检测记录，例如 record:///path/to/detections.jsonl
  #[arg(long, value_name = "RECORD")]
  pub record: Option<Url>,
  /// 标签字体文件（TTF/OTF），不设置时只绘制边框
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 推理输入宽度
  #[arg(long, requires = "inference_height", value_name = "WIDTH")]
  pub inference_width: Option<u32>,
  /// 推理输入高度
  #[arg(long, requires = "inference_width", value_name = "HEIGHT")]
  pub inference_height: Option<u32>,
  /// 最大处理帧数（0 表示无限制）
  #[arg(long, default_value = "0", value_name = "COUNT")]
  pub max_frames: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("检测器: {}", args.detector);
  info!("输出路径: {}", args.output);

  let input = GStreamerInputPipelineBuilder::from_url(&args.input)?;
  let detector = ReplayDetector::from_url(&args.detector)?;
  let config = EncoderConfig::from_url(&args.output)?;

  let cancel = Arc::new(AtomicBool::new(false));
  let flag = cancel.clone();
  ctrlc::set_handler(move || {
    warn!("收到中断信号，准备退出...");
    flag.store(true, Ordering::SeqCst);
  })?;

  let mut draw = Draw::default();
  if let Some(font) = &args.font {
    draw = draw.with_font_file(font)?;
  }

  let mut task = AnnotateTask::new(config)
    .with_draw(draw)
    .with_cancel(cancel)
    .with_max_frames((args.max_frames > 0).then_some(args.max_frames))
    .with_inference_size(args.inference_width.zip(args.inference_height))
    .with_progress(|progress: Progress| match progress.fraction() {
      Some(fraction) if progress.processed % 25 == 0 => {
        info!("已处理 {} 帧 ({:.0}%)", progress.processed, fraction * 100.0)
      }
      None if progress.processed % 25 == 0 => info!("已处理 {} 帧", progress.processed),
      _ => {}
    });

  if let Some(record) = &args.record {
    task = task.with_record(DetectionRecord::from_url(record)?);
  }

  let output = task.run_task(input, detector, GStreamerVideoOutput)?;
  info!(
    "检测完成: {} ({}x{} @ {} fps, {} 帧, {} 字节, {})",
    output.path.display(),
    output.width,
    output.height,
    output.fps,
    output.frame_count,
    output.byte_len,
    output.mime_type()
  );

  Ok(())
}
