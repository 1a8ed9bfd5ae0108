// 该文件是 Poubelle 项目的一部分。
// src/input.rs - 视频/图像输入
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

use std::{collections::VecDeque, convert::Infallible};

use crate::frame::RgbFrame;

#[cfg(feature = "image_file")]
mod read_image_file;
#[cfg(feature = "image_file")]
pub use self::read_image_file::{ImageFileInput, ImageFileInputError};

#[cfg(feature = "gstreamer")]
mod gstreamer_input;
#[cfg(feature = "gstreamer")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

/// 视频源未报告有效帧率时使用的帧率
pub const DEFAULT_FPS: f64 = 24.0;

/// 视频源元数据，帧数只是估计值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
  pub width: u32,
  pub height: u32,
  pub fps: Option<f64>,
  pub frame_count: Option<u64>,
}

impl SourceInfo {
  pub fn effective_fps(&self) -> f64 {
    match self.fps {
      Some(fps) if fps.is_finite() && fps > 0.0 => fps,
      _ => DEFAULT_FPS,
    }
  }
}

/// 已打开的视频源，按顺序产出解码后的帧
///
/// 迭代结束即视频结束；解码失败由实现方记录日志并结束迭代。
pub trait VideoSource: Iterator<Item = RgbFrame> {
  fn info(&self) -> SourceInfo;
}

/// 可以打开为 [`VideoSource`] 的视频
pub trait OpenVideo {
  type Video: VideoSource;
  type Error: std::error::Error + Send + Sync + 'static;

  fn open_video(&self) -> Result<Self::Video, Self::Error>;
}

/// 内存中的帧序列
///
/// 用于宿主已经持有解码帧的场景。每次打开都从第一帧开始。
#[derive(Debug, Clone)]
pub struct MemoryVideo {
  frames: VecDeque<RgbFrame>,
  info: SourceInfo,
}

impl MemoryVideo {
  /// 尺寸取第一帧的尺寸，没有帧时为 0x0
  pub fn new(frames: Vec<RgbFrame>, fps: Option<f64>) -> Self {
    let (width, height) = frames.first().map(RgbFrame::dimensions).unwrap_or((0, 0));
    let info = SourceInfo {
      width,
      height,
      fps,
      frame_count: Some(frames.len() as u64),
    };
    Self {
      frames: frames.into(),
      info,
    }
  }

  pub fn with_info(mut self, info: SourceInfo) -> Self {
    self.info = info;
    self
  }
}

impl Iterator for MemoryVideo {
  type Item = RgbFrame;

  fn next(&mut self) -> Option<Self::Item> {
    self.frames.pop_front()
  }
}

impl VideoSource for MemoryVideo {
  fn info(&self) -> SourceInfo {
    self.info
  }
}

impl OpenVideo for MemoryVideo {
  type Video = MemoryVideo;
  type Error = Infallible;

  fn open_video(&self) -> Result<Self::Video, Self::Error> {
    Ok(self.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn effective_fps_falls_back() {
    let mut info = SourceInfo {
      width: 1,
      height: 1,
      fps: None,
      frame_count: None,
    };
    assert_eq!(info.effective_fps(), DEFAULT_FPS);
    info.fps = Some(0.0);
    assert_eq!(info.effective_fps(), DEFAULT_FPS);
    info.fps = Some(f64::INFINITY);
    assert_eq!(info.effective_fps(), DEFAULT_FPS);
    info.fps = Some(29.97);
    assert_eq!(info.effective_fps(), 29.97);
  }

  #[test]
  fn memory_video_reopens_from_start() {
    let video = MemoryVideo::new(vec![RgbFrame::with_shape(4, 2); 3], Some(10.0));
    assert_eq!(video.info().width, 4);
    assert_eq!(video.info().frame_count, Some(3));

    let first: Vec<_> = video.open_video().unwrap().collect();
    let second: Vec<_> = video.open_video().unwrap().collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
  }

  #[test]
  fn empty_memory_video() {
    let video = MemoryVideo::new(Vec::new(), None);
    assert_eq!(video.info().width, 0);
    assert_eq!(video.open_video().unwrap().count(), 0);
  }
}
