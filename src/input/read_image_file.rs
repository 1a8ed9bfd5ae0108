// 该文件是 Poubelle 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use std::path::Path;

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decoded_path, frame::RgbFrame};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("URL path decoding error: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

pub struct ImageFileInput {
  frame: RgbFrame,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    Self::open(decoded_path(url)?)
  }
}

impl ImageFileInput {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageFileInputError> {
    let path = path.as_ref();
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    let frame = RgbFrame::from(image.to_rgb8());
    info!(
      "Loaded image {} ({}x{})",
      path.display(),
      frame.width(),
      frame.height()
    );

    Ok(ImageFileInput { frame })
  }

  pub fn into_frame(self) -> RgbFrame {
    self.frame
  }
}

impl From<ImageFileInput> for RgbFrame {
  fn from(input: ImageFileInput) -> Self {
    input.into_frame()
  }
}
