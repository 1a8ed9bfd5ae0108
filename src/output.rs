// 该文件是 Poubelle 项目的一部分。
// src/output.rs - 输出定义
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
  path::{Path, PathBuf},
  str::FromStr,
};

use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, InvalidQueryParam, decoded_path, frame::RgbFrame, query_param,
};

pub mod draw;
pub mod record;

#[cfg(feature = "image_file")]
mod save_image_file;
#[cfg(feature = "image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "gstreamer")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer")]
pub use self::gstreamer_video_output::{
  GStreamerVideoOutput, GStreamerVideoOutputError, GStreamerVideoSink,
};

/// 逐帧写入的视频输出
pub trait VideoSink {
  type Error: std::error::Error + Send + Sync + 'static;

  fn write_frame(&mut self, frame: &RgbFrame) -> Result<(), Self::Error>;

  /// 完成编码并关闭容器
  fn finish(self) -> Result<(), Self::Error>;
}

/// 按编码设置创建 [`VideoSink`]，编码器或容器不可用时返回错误
pub trait OpenSink {
  type Sink: VideoSink;
  type Error: std::error::Error + Send + Sync + 'static;

  fn open_sink(&self, settings: &SinkSettings) -> Result<Self::Sink, Self::Error>;
}

/// 保存单帧图像
pub trait SaveFrame {
  type Error: std::error::Error + Send + Sync + 'static;

  fn save_frame(&self, frame: &RgbFrame) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("未知的编码格式: {0}")]
  UnknownCodec(String),
  #[error("参数验证错误: {0}")]
  ValidationError(String),
}

/// 编码器与容器的组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
  /// VP9 / WebM
  Vp9WebM,
  /// H.264 / MP4
  H264Mp4,
  /// H.264 / Matroska
  H264Matroska,
  /// Motion JPEG / AVI
  MjpegAvi,
}

impl Codec {
  pub fn from_extension(ext: &str) -> Option<Self> {
    match ext.to_ascii_lowercase().as_str() {
      "webm" => Some(Codec::Vp9WebM),
      "mp4" => Some(Codec::H264Mp4),
      "mkv" => Some(Codec::H264Matroska),
      "avi" => Some(Codec::MjpegAvi),
      _ => None,
    }
  }

  pub fn extension(&self) -> &'static str {
    match self {
      Codec::Vp9WebM => "webm",
      Codec::H264Mp4 => "mp4",
      Codec::H264Matroska => "mkv",
      Codec::MjpegAvi => "avi",
    }
  }

  pub fn mime_type(&self) -> &'static str {
    match self {
      Codec::Vp9WebM => "video/webm",
      Codec::H264Mp4 => "video/mp4",
      Codec::H264Matroska => "video/x-matroska",
      Codec::MjpegAvi => "video/x-msvideo",
    }
  }
}

impl std::fmt::Display for Codec {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Codec::Vp9WebM => "vp9/webm",
      Codec::H264Mp4 => "h264/mp4",
      Codec::H264Matroska => "h264/mkv",
      Codec::MjpegAvi => "mjpeg/avi",
    };
    f.write_str(name)
  }
}

impl FromStr for Codec {
  type Err = OutputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some(codec) = Self::from_extension(s) {
      return Ok(codec);
    }
    match s.to_ascii_lowercase().as_str() {
      "vp9" => Ok(Codec::Vp9WebM),
      "h264" | "x264" => Ok(Codec::H264Mp4),
      "mjpeg" | "jpeg" => Ok(Codec::MjpegAvi),
      _ => Err(OutputError::UnknownCodec(s.to_string())),
    }
  }
}

/// 单次打开输出时使用的编码参数
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
  pub path: PathBuf,
  pub codec: Codec,
  pub width: u32,
  pub height: u32,
  pub fps: f64,
}

const DEFAULT_CODEC: Codec = Codec::Vp9WebM;
const DEFAULT_FALLBACK: Codec = Codec::MjpegAvi;

/// 视频编码配置
///
/// 未设置的宽高在打开视频源后取源尺寸；未设置或非法的帧率取源帧率。
/// 输出文件扩展名由实际使用的编码格式决定。
///
/// URL 格式：`video:///path/to/output.webm?width=640&height=480&fps=24&fallback=avi`
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
  pub path: PathBuf,
  pub codec: Codec,
  pub fallback: Option<Codec>,
  pub fps: Option<f64>,
  pub width: Option<u32>,
  pub height: Option<u32>,
}

impl EncoderConfig {
  pub fn new(path: impl AsRef<Path>, codec: Codec) -> Self {
    let fallback = (codec != DEFAULT_FALLBACK).then_some(DEFAULT_FALLBACK);
    Self {
      path: path.as_ref().to_path_buf(),
      codec,
      fallback,
      fps: None,
      width: None,
      height: None,
    }
  }

  pub fn with_size(mut self, width: u32, height: u32) -> Self {
    self.width = Some(width);
    self.height = Some(height);
    self
  }

  pub fn with_fps(mut self, fps: Option<f64>) -> Self {
    self.fps = fps;
    self
  }

  pub fn with_fallback(mut self, fallback: Option<Codec>) -> Self {
    self.fallback = fallback;
    self
  }

  /// 依次尝试的编码格式：主编码格式，然后是备用格式
  pub fn candidates(&self) -> Vec<Codec> {
    let mut codecs = vec![self.codec];
    if let Some(fallback) = self.fallback
      && fallback != self.codec
    {
      codecs.push(fallback);
    }
    codecs
  }

  pub fn path_for(&self, codec: Codec) -> PathBuf {
    self.path.with_extension(codec.extension())
  }

  /// 显式配置的宽高必须为正数
  pub fn has_valid_size(&self) -> bool {
    self.width != Some(0) && self.height != Some(0)
  }

  /// 结合视频源尺寸得到最终的输出尺寸
  pub fn resolve_size(&self, source: (u32, u32)) -> (u32, u32) {
    (
      self.width.unwrap_or(source.0),
      self.height.unwrap_or(source.1),
    )
  }

  /// 合法的帧率配置，非正数或非有限值视为未设置
  pub fn valid_fps(&self) -> Option<f64> {
    self.fps.filter(|fps| fps.is_finite() && *fps > 0.0)
  }
}

impl FromUrlWithScheme for EncoderConfig {
  const SCHEME: &'static str = "video";
}

impl FromUrl for EncoderConfig {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let path = PathBuf::from(
      decoded_path(url).map_err(|e| OutputError::ValidationError(e.to_string()))?,
    );
    if path.file_stem().is_none() {
      return Err(OutputError::ValidationError(format!(
        "输出路径缺少文件名: {}",
        path.display()
      )));
    }

    let codec = path
      .extension()
      .and_then(|ext| ext.to_str())
      .and_then(Codec::from_extension)
      .unwrap_or(DEFAULT_CODEC);

    let mut config = EncoderConfig::new(&path, codec);

    if let Some((_, fallback)) = url.query_pairs().find(|(k, _)| k == "fallback") {
      config.fallback = match &*fallback {
        "none" | "" => None,
        other => Some(other.parse()?),
      };
    }

    let invalid = |e: InvalidQueryParam| OutputError::ValidationError(e.to_string());
    config.fps = query_param::<f64>(url, "fps").map_err(invalid)?;
    config.width = query_param::<u32>(url, "width").map_err(invalid)?;
    config.height = query_param::<u32>(url, "height").map_err(invalid)?;

    if !config.has_valid_size() {
      return Err(OutputError::ValidationError(format!(
        "输出尺寸必须为正数: {:?}x{:?}",
        config.width, config.height
      )));
    }
    if config.fps.is_some() && config.valid_fps().is_none() {
      return Err(OutputError::ValidationError(format!(
        "帧率必须为正数: {:?}",
        config.fps
      )));
    }

    Ok(config)
  }
}

/// 编码完成的输出视频
#[derive(Debug, Clone, PartialEq)]
pub struct OutputVideo {
  pub path: PathBuf,
  pub codec: Codec,
  pub width: u32,
  pub height: u32,
  pub fps: f64,
  pub frame_count: u64,
  pub byte_len: u64,
}

impl OutputVideo {
  pub fn mime_type(&self) -> &'static str {
    self.codec.mime_type()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codec_from_extension_and_name() {
    assert_eq!(Codec::from_extension("WEBM"), Some(Codec::Vp9WebM));
    assert_eq!(Codec::from_extension("mov"), None);
    assert_eq!("mjpeg".parse::<Codec>().unwrap(), Codec::MjpegAvi);
    assert_eq!("mp4".parse::<Codec>().unwrap(), Codec::H264Mp4);
    assert!("theora".parse::<Codec>().is_err());
  }

  #[test]
  fn config_from_url() {
    let url = Url::parse("video:///tmp/out/result.mp4?width=320&height=240&fps=12.5").unwrap();
    let config = EncoderConfig::from_url(&url).unwrap();
    assert_eq!(config.codec, Codec::H264Mp4);
    assert_eq!(config.fallback, Some(Codec::MjpegAvi));
    assert_eq!(config.width, Some(320));
    assert_eq!(config.height, Some(240));
    assert_eq!(config.fps, Some(12.5));
    assert_eq!(
      config.path_for(Codec::MjpegAvi),
      PathBuf::from("/tmp/out/result.avi")
    );
  }

  #[test]
  fn config_defaults_and_fallback_override() {
    let url = Url::parse("video:///tmp/result?fallback=none").unwrap();
    let config = EncoderConfig::from_url(&url).unwrap();
    assert_eq!(config.codec, Codec::Vp9WebM);
    assert_eq!(config.candidates(), vec![Codec::Vp9WebM]);
    assert_eq!(config.resolve_size((640, 480)), (640, 480));
    assert_eq!(config.path_for(config.codec), PathBuf::from("/tmp/result.webm"));

    let url = Url::parse("video:///tmp/result.avi?fallback=mkv").unwrap();
    let config = EncoderConfig::from_url(&url).unwrap();
    assert_eq!(config.candidates(), vec![Codec::MjpegAvi, Codec::H264Matroska]);

    let url = Url::parse("video:///tmp/result.avi?fallback=ogg").unwrap();
    assert!(matches!(
      EncoderConfig::from_url(&url),
      Err(OutputError::UnknownCodec(_))
    ));
  }

  #[test]
  fn avi_primary_has_no_duplicate_fallback() {
    let config = EncoderConfig::new("/tmp/a.avi", Codec::MjpegAvi);
    assert_eq!(config.candidates(), vec![Codec::MjpegAvi]);
  }

  #[test]
  fn size_and_fps_validation() {
    let config = EncoderConfig::new("/tmp/a", Codec::Vp9WebM).with_size(0, 480);
    assert!(!config.has_valid_size());
    let config = config.with_size(640, 480).with_fps(Some(-1.0));
    assert!(config.has_valid_size());
    assert_eq!(config.valid_fps(), None);
    assert_eq!(config.with_fps(Some(f64::NAN)).valid_fps(), None);
  }

  #[test]
  fn rejects_invalid_size_and_fps() {
    for query in [
      "width=-1&height=480",
      "width=-640&height=480&fps=abc",
      "width=640&height=0",
      "height=abc",
      "fps=abc",
      "fps=0",
      "fps=-12",
    ] {
      let url = Url::parse(&format!("video:///tmp/out.webm?{}", query)).unwrap();
      assert!(
        matches!(
          EncoderConfig::from_url(&url),
          Err(OutputError::ValidationError(_))
        ),
        "{}",
        query
      );
    }
  }

  #[test]
  fn config_path_is_percent_decoded() {
    let url = Url::parse("video:///tmp/my%20clips/bin%20day.mp4").unwrap();
    let config = EncoderConfig::from_url(&url).unwrap();
    assert_eq!(config.path, PathBuf::from("/tmp/my clips/bin day.mp4"));
    assert_eq!(config.codec, Codec::H264Mp4);
  }

  #[test]
  fn rejects_wrong_scheme() {
    let url = Url::parse("gst://file/tmp/in.mp4").unwrap();
    assert!(matches!(
      EncoderConfig::from_url(&url),
      Err(OutputError::SchemeMismatch(_))
    ));
  }
}
