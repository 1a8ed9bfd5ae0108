// 该文件是 Poubelle 项目的一部分。
// src/model/replay.rs - 回放外部推理结果的检测器
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

//! 回放检测器
//!
//! 读取外部推理服务导出的逐帧检测记录（格式见 [`crate::output::record`]），
//! 按帧序号依次返回。记录的坐标会按记录帧尺寸与当前帧尺寸的比例缩放，
//! 因此推理前缩放帧不影响框的位置。
//!
//! URL 格式：`replay:///path/to/detections.jsonl?confidence=0.25`

use std::{
  cell::Cell,
  collections::BTreeMap,
  convert::Infallible,
  fs::File,
  io::{BufRead, BufReader},
  path::Path,
};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbFrame,
  model::{Detection, Detector},
  output::record::FrameRecord,
  InvalidQueryParam, decoded_path, query_param,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URL 路径解码错误: {0}")]
  PathDecodeError(#[from] std::string::FromUtf8Error),
  #[error("参数错误: {0}")]
  InvalidParameter(#[from] InvalidQueryParam),
  #[error("第 {line} 行解析失败: {source}")]
  ParseError {
    line: usize,
    #[source]
    source: serde_json::Error,
  },
}

pub struct ReplayDetector {
  frames: BTreeMap<u64, FrameRecord>,
  cursor: Cell<u64>,
  min_confidence: f32,
}

impl FromUrlWithScheme for ReplayDetector {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayDetector {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch(format!(
        "期望检测器 '{}', 实际检测器 '{}'",
        Self::SCHEME,
        url.scheme()
      )));
    }

    let confidence = query_param::<f32>(url, "confidence")?;
    let detector = Self::open(decoded_path(url)?)?;
    Ok(match confidence {
      Some(confidence) => detector.with_min_confidence(confidence),
      None => detector,
    })
  }
}

impl ReplayDetector {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
    let path = path.as_ref();
    info!("加载检测记录: {}", path.display());
    let detector = Self::from_reader(BufReader::new(File::open(path)?))?;
    info!("检测记录加载完成: {} 帧", detector.len());
    Ok(detector)
  }

  pub fn from_reader(reader: impl BufRead) -> Result<Self, ReplayError> {
    let mut frames = BTreeMap::new();
    for (idx, line) in reader.lines().enumerate() {
      let line = line?;
      if line.trim().is_empty() {
        continue;
      }
      let record: FrameRecord = serde_json::from_str(&line).map_err(|source| {
        ReplayError::ParseError {
          line: idx + 1,
          source,
        }
      })?;
      frames.insert(record.frame, record);
    }

    Ok(Self {
      frames,
      cursor: Cell::new(0),
      min_confidence: 0.0,
    })
  }

  pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
    self.min_confidence = min_confidence;
    self
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  /// 从第 0 帧重新开始回放
  pub fn rewind(&self) {
    self.cursor.set(0);
  }
}

impl Detector for ReplayDetector {
  type Error = Infallible;

  fn infer(&self, frame: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
    let index = self.cursor.get();
    self.cursor.set(index + 1);

    let Some(record) = self.frames.get(&index) else {
      debug!("第 {} 帧没有检测记录", index);
      return Ok(Vec::new());
    };

    let (sx, sy) = if record.width > 0 && record.height > 0 {
      (
        frame.width() as f32 / record.width as f32,
        frame.height() as f32 / record.height as f32,
      )
    } else {
      (1.0, 1.0)
    };

    Ok(
      record
        .detections
        .iter()
        .filter(|d| d.confidence >= self.min_confidence)
        .map(|d| Detection {
          label: d.label.clone(),
          confidence: d.confidence,
          bbox: d.bbox.scaled(sx, sy),
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  const RECORDS: &str = r#"{"frame":0,"width":100,"height":100,"detections":[{"label":"poubelle_vide","confidence":0.9,"bbox":[10.0,10.0,50.0,50.0]}]}

{"frame":2,"width":100,"height":100,"detections":[{"label":"poubelle_pleine","confidence":0.2,"bbox":[0.0,0.0,10.0,10.0]},{"label":"poubelle_pleine","confidence":0.7,"bbox":[20.0,20.0,40.0,40.0]}]}
"#;

  #[test]
  fn replays_by_frame_index() {
    let detector = ReplayDetector::from_reader(RECORDS.as_bytes()).unwrap();
    assert_eq!(detector.len(), 2);

    let frame = RgbFrame::with_shape(100, 100);
    let first = detector.infer(&frame).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].label, "poubelle_vide");

    // 第 1 帧没有记录
    assert!(detector.infer(&frame).unwrap().is_empty());
    assert_eq!(detector.infer(&frame).unwrap().len(), 2);
    assert!(detector.infer(&frame).unwrap().is_empty());

    detector.rewind();
    assert_eq!(detector.infer(&frame).unwrap().len(), 1);
  }

  #[test]
  fn scales_to_inferred_frame() {
    let detector = ReplayDetector::from_reader(RECORDS.as_bytes()).unwrap();
    let frame = RgbFrame::with_shape(50, 200);
    let dets = detector.infer(&frame).unwrap();
    assert_eq!(dets[0].bbox, BoundingBox::new(5.0, 20.0, 25.0, 100.0));
  }

  #[test]
  fn filters_by_confidence() {
    let detector = ReplayDetector::from_reader(RECORDS.as_bytes())
      .unwrap()
      .with_min_confidence(0.5);
    let frame = RgbFrame::with_shape(100, 100);
    detector.infer(&frame).unwrap();
    detector.infer(&frame).unwrap();
    let dets = detector.infer(&frame).unwrap();
    assert_eq!(dets.len(), 1);
    assert_eq!(dets[0].confidence, 0.7);
  }

  #[test]
  fn reports_bad_line() {
    let err = ReplayDetector::from_reader("{\"frame\":0}\nnot json\n".as_bytes())
      .err()
      .unwrap();
    assert!(matches!(err, ReplayError::ParseError { line: 1, .. }));
  }

  #[test]
  fn from_url_reads_confidence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dets.jsonl");
    std::fs::write(&path, RECORDS).unwrap();

    let url = Url::parse(&format!("replay://{}?confidence=0.95", path.display())).unwrap();
    let detector = ReplayDetector::from_url(&url).unwrap();
    let frame = RgbFrame::with_shape(100, 100);
    assert!(detector.infer(&frame).unwrap().is_empty());

    let url = Url::parse(&format!("replay://{}?confidence=high", path.display())).unwrap();
    assert!(matches!(
      ReplayDetector::from_url(&url),
      Err(ReplayError::InvalidParameter(_))
    ));
  }

  #[test]
  fn from_url_decodes_spaces() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("bin records");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("dets.jsonl"), RECORDS).unwrap();

    // Url::parse 会把空格编码为 %20
    let url = Url::parse(&format!("replay://{}/dets.jsonl", nested.display())).unwrap();
    assert!(url.path().contains("%20"));
    assert_eq!(ReplayDetector::from_url(&url).unwrap().len(), 2);
  }
}
