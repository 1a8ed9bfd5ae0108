// 该文件是 Poubelle 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
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

//! # GStreamer 视频文件输出模块
//!
//! 将标注后的 RGB 帧编码为视频文件。
//!
//! ## 支持的格式
//!
//! - **WebM** (VP9) - 浏览器可直接播放
//! - **MP4** (H.264)
//! - **MKV** (H.264)
//! - **AVI** (Motion JPEG) - 只依赖 gst-plugins-good，适合作为备用格式
//!
//! 编码器插件缺失时 `gst::parse::launch` 失败，调用方据此切换到备用格式。

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  frame::RgbFrame,
  output::{Codec, OpenSink, SinkSettings, VideoSink},
  quote_location,
};

const RGB_CHANNELS: usize = 3;
const EOS_TIMEOUT_SECS: u64 = 30;

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 无法转换元素为 appsrc
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 帧尺寸与编码尺寸不一致
  #[error("Frame size {actual:?} does not match encoder size {expected:?}")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
}

fn encoder_description(codec: Codec, path: &Path) -> String {
  let encoder = match codec {
    Codec::Vp9WebM => "videoconvert ! vp9enc deadline=1 cpu-used=8 ! webmmux",
    Codec::H264Mp4 => {
      "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux"
    }
    Codec::H264Matroska => {
      "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux"
    }
    Codec::MjpegAvi => "videoconvert ! jpegenc ! avimux",
  };
  format!(
    "appsrc name=src ! {} ! filesink location={}",
    encoder,
    quote_location(&path.to_string_lossy())
  )
}

/// 创建 GStreamer 编码管道
#[derive(Debug, Clone, Copy, Default)]
pub struct GStreamerVideoOutput;

impl OpenSink for GStreamerVideoOutput {
  type Sink = GStreamerVideoSink;
  type Error = GStreamerVideoOutputError;

  fn open_sink(&self, settings: &SinkSettings) -> Result<Self::Sink, Self::Error> {
    // Initialize GStreamer (subsequent calls are safe no-ops)
    gst::init()?;

    if let Some(parent) = settings.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)
        .map_err(|e| GStreamerVideoOutputError::PipelineError(e.to_string()))?;
    }

    let pipeline_desc = encoder_description(settings.codec, &settings.path);
    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcConversionFailed)?;

    // 帧率以千分之一精度表示
    let framerate = gst::Fraction::new((settings.fps * 1000.0).round() as i32, 1000);
    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", settings.width as i32)
      .field("height", settings.height as i32)
      .field("framerate", framerate)
      .build();

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    // 编码跟不上时阻塞推送，避免缓冲无限增长
    appsrc.set_block(true);

    let sink = GStreamerVideoSink {
      pipeline,
      appsrc,
      width: settings.width,
      height: settings.height,
      fps: settings.fps,
      frame_count: 0,
    };
    sink.pipeline.set_state(gst::State::Playing)?;

    info!(
      "Video output initialized: {}x{} @ {} fps ({}) -> {}",
      settings.width,
      settings.height,
      settings.fps,
      settings.codec,
      settings.path.display()
    );

    Ok(sink)
  }
}

/// GStreamer 编码管道
///
/// Drop 时总会把管道置为 Null 以释放文件句柄；只有调用
/// [`VideoSink::finish`] 才会发送 EOS 并写完容器尾部。
pub struct GStreamerVideoSink {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  width: u32,
  height: u32,
  fps: f64,
  frame_count: u64,
}

impl Drop for GStreamerVideoSink {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
    debug!("Video output closed. Total frames written: {}", self.frame_count);
  }
}

impl GStreamerVideoSink {
  fn bus_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
      gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
      _ => None,
    }
  }

  fn padded_frame(&self, frame: &RgbFrame) -> Vec<u8> {
    let row = self.width as usize * RGB_CHANNELS;
    // RGB 行按 4 字节对齐
    let stride = (row + 3) & !3;
    if stride == row {
      return frame.as_hwc().to_vec();
    }

    let mut data = vec![0u8; stride * self.height as usize];
    for (y, src) in frame.as_hwc().chunks_exact(row).enumerate() {
      data[y * stride..y * stride + row].copy_from_slice(src);
    }
    data
  }
}

impl VideoSink for GStreamerVideoSink {
  type Error = GStreamerVideoOutputError;

  fn write_frame(&mut self, frame: &RgbFrame) -> Result<(), Self::Error> {
    if frame.dimensions() != (self.width, self.height) {
      return Err(GStreamerVideoOutputError::FrameSizeMismatch {
        expected: (self.width, self.height),
        actual: frame.dimensions(),
      });
    }

    let mut buffer = gst::Buffer::from_mut_slice(self.padded_frame(frame));
    {
      let buffer_ref = buffer.get_mut().ok_or_else(|| {
        GStreamerVideoOutputError::PipelineError("Buffer is not writable".to_string())
      })?;
      let frame_duration = 1_000_000_000.0 / self.fps;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(
        (self.frame_count as f64 * frame_duration) as u64,
      ));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_duration as u64));
    }

    self.appsrc.push_buffer(buffer).map_err(|e| {
      let detail = self.bus_error().unwrap_or_default();
      GStreamerVideoOutputError::PipelineError(format!("Failed to push buffer: {:?} {}", e, detail))
    })?;
    self.frame_count += 1;

    Ok(())
  }

  fn finish(self) -> Result<(), Self::Error> {
    self.appsrc.end_of_stream().map_err(|e| {
      GStreamerVideoOutputError::PipelineError(format!("Failed to send EOS: {:?}", e))
    })?;

    let bus = self
      .pipeline
      .bus()
      .ok_or_else(|| GStreamerVideoOutputError::PipelineError("Pipeline has no bus".to_string()))?;

    // 等待 EOS 到达 filesink，容器尾部写完后才能关闭
    let msg = bus.timed_pop_filtered(
      gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
      &[gst::MessageType::Eos, gst::MessageType::Error],
    );

    match msg.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Eos(..)) => {
        info!("Video output finished: {} frames", self.frame_count);
        Ok(())
      }
      Some(gst::MessageView::Error(err)) => {
        error!("Encoder error: {}", err.error());
        Err(GStreamerVideoOutputError::PipelineError(format!(
          "{} ({:?})",
          err.error(),
          err.debug()
        )))
      }
      _ => Err(GStreamerVideoOutputError::PipelineError(
        "Timed out waiting for EOS".to_string(),
      )),
    }
  }
}
