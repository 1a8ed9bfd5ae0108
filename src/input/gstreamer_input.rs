// 该文件是 Poubelle 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
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

//! # GStreamer 视频输入模块
//!
//! 通过 `decodebin` 解码视频文件，输出 RGB 帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! ## URL 格式
//!
//! - `gst://file/path/to/video.mp4` - 读取视频文件
//! - `gst://file/path/to/video.mp4?rotate=90` - 读取并旋转（0/90/180/270）
//!
//! ## 基本用法
//!
//! ```no_run
//! use poubelle::{FromUrl, input::{GStreamerInputPipelineBuilder, OpenVideo, VideoSource}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst://file/tmp/upload.mp4")?;
//! let input = GStreamerInputPipelineBuilder::from_url(&url)?.open_video()?;
//! println!("{:?}", input.info());
//! for frame in input {
//!     println!("frame: {}x{}", frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decoded_path,
  frame::RgbFrame,
  input::{OpenVideo, SourceInfo, VideoSource},
  quote_location,
};

const RGB_CHANNELS: usize = 3;
const PREROLL_TIMEOUT_SECS: u64 = 10;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不匹配（期望 "gst://file/..."）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// URL 路径解码错误
  #[error("URL path decoding error: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  VideoFlip { method: u32, direction: u32 },
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!("filesrc location={} ! decodebin", quote_location(path))
      }
      GStreamerInputBuilderItem::VideoFlip { method, direction } => {
        format!("videoflip method={} video-direction={}", method, direction)
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 输入管道构建器
///
/// 每次 [`OpenVideo::open_video`] 都会创建一条新管道，从头开始解码。
#[derive(Debug, Clone)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl GStreamerInputPipelineBuilder {
  pub fn file(path: &str) -> Self {
    GStreamerInputPipelineBuilder {
      items: vec![GStreamerInputBuilderItem::FileSource(path.to_string())],
    }
  }

  pub fn rotate(mut self, degrees: u32) -> Self {
    if let Some(flip) = Self::video_flip(degrees) {
      self.items.push(flip);
    }
    self
  }

  fn video_flip(degrees: u32) -> Option<GStreamerInputBuilderItem> {
    let (method, direction) = match degrees {
      90 => (1, 1),
      180 => (2, 2),
      270 => (3, 3),
      _ => return None,
    };
    Some(GStreamerInputBuilderItem::VideoFlip { method, direction })
  }

  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .chain(std::iter::once(&GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      }))
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");

    // 文件解码不能丢帧，也不需要按时钟同步
    format!(
      "{} ! appsink name=sink sync=false max-buffers=4 drop=false",
      basic_pipeline
    )
  }

  pub fn build(&self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 先预卷以读取 caps 和时长，失败时 Drop 会把管道置为 Null
    let mut input = GStreamerInput {
      pipeline,
      appsink,
      info: SourceInfo {
        width: 0,
        height: 0,
        fps: None,
        frame_count: None,
      },
    };
    input.preroll()?;
    input.pipeline.set_state(gst::State::Playing)?;

    Ok(input)
  }
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let builder = match url.host_str() {
      Some("file") => Self::file(&decoded_path(url)?),
      _ => return Err(GStreamerInputError::SchemeMismatch),
    };

    let rotate = query
      .get("rotate")
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(0);

    Ok(builder.rotate(rotate))
  }
}

impl OpenVideo for GStreamerInputPipelineBuilder {
  type Video = GStreamerInput;
  type Error = GStreamerInputError;

  fn open_video(&self) -> Result<Self::Video, Self::Error> {
    self.build()
  }
}

/// GStreamer 视频输入
///
/// 管理 GStreamer 管道和 appsink，按顺序产出 RGB 帧。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  info: SourceInfo,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  fn preroll(&mut self) -> Result<(), GStreamerInputError> {
    self.pipeline.set_state(gst::State::Paused)?;
    let (result, _, _) = self
      .pipeline
      .state(gst::ClockTime::from_seconds(PREROLL_TIMEOUT_SECS));
    result?;

    // 预卷样本在进入 Playing 后仍会作为第一帧返回
    let sample = self.appsink.pull_preroll()?;
    let caps = sample
      .caps()
      .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;
    let video_info =
      gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

    let fps = video_info.fps();
    let fps = (fps.numer() > 0 && fps.denom() > 0).then(|| fps.numer() as f64 / fps.denom() as f64);

    let frame_count = match (self.pipeline.query_duration::<gst::ClockTime>(), fps) {
      (Some(duration), Some(fps)) => {
        Some((duration.nseconds() as f64 / 1_000_000_000.0 * fps).round() as u64)
      }
      _ => None,
    };

    self.info = SourceInfo {
      width: video_info.width(),
      height: video_info.height(),
      fps,
      frame_count,
    };
    info!("Video source opened: {:?}", self.info);

    Ok(())
  }

  fn pull_sample(&self) -> Option<gst::Sample> {
    if self.appsink.is_eos() {
      return None;
    }

    self
      .appsink
      .pull_sample()
      .map_err(|e| {
        // EOS 也会以错误返回
        if !self.appsink.is_eos() {
          error!("Failed to pull sample: {}", e);
        }
        e
      })
      .ok()
  }
}

impl Iterator for GStreamerInput {
  type Item = RgbFrame;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = self.pull_sample()?;
    convert_sample_to_frame(&sample)
      .map_err(|e| {
        error!("Failed to fetch sample: {}", e);
        e
      })
      .ok()
  }
}

impl VideoSource for GStreamerInput {
  fn info(&self) -> SourceInfo {
    self.info
  }
}

fn convert_sample_to_frame(sample: &gst::Sample) -> Result<RgbFrame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("No caps in sample".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerInputError::UnsupportedFormat);
  }

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let row = width * RGB_CHANNELS;
  // RGB 行按 4 字节对齐，需要按 stride 逐行拷贝
  let stride = video_info.stride()[0] as usize;

  let map = buffer.map_readable().map_err(|e| {
    GStreamerInputError::PipelineError(format!("Failed to map buffer for reading: {}", e))
  })?;
  let data = map.as_slice();

  let expected = if height == 0 {
    0
  } else {
    stride * (height - 1) + row
  };
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut frame = RgbFrame::with_shape(width as u32, height as u32);
  let frame_slice = frame.as_mut();
  for y in 0..height {
    frame_slice[y * row..(y + 1) * row].copy_from_slice(&data[y * stride..y * stride + row]);
  }
  debug!("Decoded frame {}x{} (stride {})", width, height, stride);

  Ok(frame)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_from_url() {
    let url = Url::parse("gst://file/tmp/upload.mp4?rotate=90").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert_eq!(
      builder.description(),
      "filesrc location=\"/tmp/upload.mp4\" ! decodebin ! videoflip method=1 video-direction=1 \
       ! videoconvert ! video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=4 drop=false"
    );
  }

  #[test]
  fn decodes_escaped_path() {
    let url = Url::parse("gst://file/tmp/bin%20day/%22clip%22.mp4").unwrap();
    let builder = GStreamerInputPipelineBuilder::from_url(&url).unwrap();
    assert!(
      builder
        .description()
        .starts_with(r#"filesrc location="/tmp/bin day/\"clip\".mp4" ! decodebin"#)
    );
  }

  #[test]
  fn rejects_unknown_host() {
    let url = Url::parse("gst://camera/dev/video0").unwrap();
    assert!(matches!(
      GStreamerInputPipelineBuilder::from_url(&url),
      Err(GStreamerInputError::SchemeMismatch)
    ));
  }
}
