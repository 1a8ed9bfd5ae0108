// 该文件是 Poubelle 项目的一部分。
// src/output/record.rs - 逐帧检测结果记录
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

//! 检测记录使用 JSON Lines 格式，每行对应一帧：
//!
//! ```text
//! {"frame":0,"width":640,"height":480,"timestamp":"2026-01-01T00:00:00+00:00","detections":[{"label":"poubelle_vide","confidence":0.91,"bbox":[12.0,40.0,200.0,310.0]}]}
//! ```
//!
//! 坐标为该帧（宽 `width`，高 `height`）上的像素坐标。
//! [`ReplayDetector`](crate::model::ReplayDetector) 读取同样的格式。

use std::{
  fs::File,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, decoded_path, model::Detection};

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URL 路径解码错误: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  #[error("序列化错误: {0}")]
  SerdeError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
  pub frame: u64,
  pub width: u32,
  pub height: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<String>,
  pub detections: Vec<Detection>,
}

pub struct DetectionRecord {
  path: PathBuf,
  writer: BufWriter<File>,
  frames: u64,
}

impl FromUrlWithScheme for DetectionRecord {
  const SCHEME: &'static str = "record";
}

impl FromUrl for DetectionRecord {
  type Error = RecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RecordError::SchemeMismatch(format!(
        "期望记录方式 '{}', 实际记录方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    Self::create(decoded_path(url)?)
  }
}

impl DetectionRecord {
  pub fn create(path: impl AsRef<Path>) -> Result<Self, RecordError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    let writer = BufWriter::new(File::create(&path)?);
    info!("检测记录写入: {}", path.display());

    Ok(Self {
      path,
      writer,
      frames: 0,
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn record(
    &mut self,
    frame: u64,
    (width, height): (u32, u32),
    detections: &[Detection],
  ) -> Result<(), RecordError> {
    let entry = FrameRecord {
      frame,
      width,
      height,
      timestamp: Some(chrono::Utc::now().to_rfc3339()),
      detections: detections.to_vec(),
    };
    serde_json::to_writer(&mut self.writer, &entry)?;
    self.writer.write_all(b"\n")?;
    self.frames += 1;
    Ok(())
  }

  /// 刷新缓冲并返回记录的帧数
  pub fn finish(mut self) -> Result<u64, RecordError> {
    self.writer.flush()?;
    info!("检测记录完成: {} 帧 -> {}", self.frames, self.path.display());
    Ok(self.frames)
  }
}
