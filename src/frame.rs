// 该文件是 Poubelle 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// HWC 排列的 8 位 RGB 帧，尺寸在运行时确定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
  width: u32,
  height: u32,
  data: Box<[u8]>,
}

impl RgbFrame {
  pub fn with_shape(width: u32, height: u32) -> Self {
    let size = RGB_CHANNELS * (width as usize) * (height as usize);
    Self {
      width,
      height,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = RGB_CHANNELS * (width as usize) * (height as usize);
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      width,
      height,
      data: data.into_boxed_slice(),
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn dimensions(&self) -> (u32, u32) {
    (self.width, self.height)
  }

  pub fn as_hwc(&self) -> &[u8] {
    &self.data
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    let width = self.width as usize;
    let data = &self.data;

    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = ((y as usize) * width + (x as usize)) * RGB_CHANNELS;
      Rgb([data[idx], data[idx + 1], data[idx + 2]])
    })
  }

  /// 缩放到指定尺寸，尺寸一致时直接复制
  pub fn resized(&self, width: u32, height: u32) -> RgbFrame {
    if self.dimensions() == (width, height) {
      return self.clone();
    }

    let image = self.to_rgb_image();
    let scaled = image::imageops::resize(&image, width, height, FilterType::Triangle);
    RgbFrame::from(scaled)
  }
}

impl From<RgbImage> for RgbFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw().into_boxed_slice(),
    }
  }
}

impl AsRef<[u8]> for RgbFrame {
  fn as_ref(&self) -> &[u8] {
    &self.data
  }
}

impl AsMut<[u8]> for RgbFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}
