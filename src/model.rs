// 该文件是 Poubelle 项目的一部分。
// src/model.rs - 检测器能力与检测结果
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

use serde::{Deserialize, Serialize};

use crate::{frame::RgbFrame, output::draw::Draw};

/// 目标检测能力
///
/// 预训练模型由宿主进程加载一次并注入，本库只把它当作黑盒使用。
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn infer(&self, frame: &RgbFrame) -> Result<Vec<Detection>, Self::Error>;

  /// 在帧的副本上绘制检测结果，没有检测结果时返回原帧的副本
  fn render(&self, frame: &RgbFrame, detections: &[Detection]) -> RgbFrame {
    Draw::default().draw_detection(frame, detections)
  }
}

impl<D: Detector + ?Sized> Detector for &D {
  type Error = D::Error;

  fn infer(&self, frame: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
    (**self).infer(frame)
  }

  fn render(&self, frame: &RgbFrame, detections: &[Detection]) -> RgbFrame {
    (**self).render(frame, detections)
  }
}

/// 像素坐标下的边界框 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BoundingBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }

  pub fn width(&self) -> f32 {
    (self.x_max - self.x_min).max(0.0)
  }

  pub fn height(&self) -> f32 {
    (self.y_max - self.y_min).max(0.0)
  }

  /// 按比例缩放到另一分辨率的帧
  pub fn scaled(&self, sx: f32, sy: f32) -> Self {
    Self {
      x_min: self.x_min * sx,
      y_min: self.y_min * sy,
      x_max: self.x_max * sx,
      y_max: self.y_max * sy,
    }
  }
}

impl From<[f32; 4]> for BoundingBox {
  fn from(v: [f32; 4]) -> Self {
    Self::new(v[0], v[1], v[2], v[3])
  }
}

impl From<BoundingBox> for [f32; 4] {
  fn from(b: BoundingBox) -> Self {
    [b.x_min, b.y_min, b.x_max, b.y_max]
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub label: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

impl Detection {
  pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
    Self {
      label: label.into(),
      confidence,
      bbox,
    }
  }
}

/// 垃圾桶状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillState {
  Empty,
  Full,
  Unknown,
}

impl FillState {
  pub fn from_label(label: &str) -> Self {
    LabelClassifier::default().classify(label)
  }
}

impl std::fmt::Display for FillState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      FillState::Empty => write!(f, "empty"),
      FillState::Full => write!(f, "full"),
      FillState::Unknown => write!(f, "unknown"),
    }
  }
}

/// 将模型标签映射为 [`FillState`]
///
/// 匹配不区分大小写，按子串查找，先检查 Empty 关键字。
#[derive(Debug, Clone)]
pub struct LabelClassifier {
  empty: Vec<String>,
  full: Vec<String>,
}

impl Default for LabelClassifier {
  fn default() -> Self {
    Self {
      empty: vec!["vide".to_string(), "empty".to_string()],
      full: vec!["pleine".to_string(), "full".to_string()],
    }
  }
}

impl LabelClassifier {
  pub fn new<S: AsRef<str>>(empty: &[S], full: &[S]) -> Self {
    let lower = |v: &[S]| v.iter().map(|s| s.as_ref().to_lowercase()).collect();
    Self {
      empty: lower(empty),
      full: lower(full),
    }
  }

  pub fn classify(&self, label: &str) -> FillState {
    let label = label.to_lowercase();
    if self.empty.iter().any(|k| label.contains(k.as_str())) {
      FillState::Empty
    } else if self.full.iter().any(|k| label.contains(k.as_str())) {
      FillState::Full
    } else {
      FillState::Unknown
    }
  }
}

mod replay;
pub use self::replay::{ReplayDetector, ReplayError};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classify_default_keywords() {
    assert_eq!(FillState::from_label("poubelle_vide"), FillState::Empty);
    assert_eq!(FillState::from_label("Poubelle Pleine"), FillState::Full);
    assert_eq!(FillState::from_label("EMPTY_BIN"), FillState::Empty);
    assert_eq!(FillState::from_label("bin-full"), FillState::Full);
    assert_eq!(FillState::from_label("person"), FillState::Unknown);
  }

  #[test]
  fn empty_keywords_win() {
    // 两种关键字同时出现时按 Empty 处理
    assert_eq!(FillState::from_label("vide_ou_pleine"), FillState::Empty);
  }

  #[test]
  fn custom_keywords() {
    let classifier = LabelClassifier::new(&["Leer"], &["Voll"]);
    assert_eq!(classifier.classify("tonne_leer"), FillState::Empty);
    assert_eq!(classifier.classify("tonne_voll"), FillState::Full);
    assert_eq!(classifier.classify("poubelle_vide"), FillState::Unknown);
  }

  #[test]
  fn bbox_serializes_as_array() {
    let det = Detection::new("vide", 0.5, BoundingBox::new(1.0, 2.0, 3.0, 4.0));
    let json = serde_json::to_string(&det).unwrap();
    assert_eq!(json, r#"{"label":"vide","confidence":0.5,"bbox":[1.0,2.0,3.0,4.0]}"#);
    let back: Detection = serde_json::from_str(&json).unwrap();
    assert_eq!(back, det);
  }

  #[test]
  fn bbox_scaling() {
    let b = BoundingBox::new(10.0, 20.0, 30.0, 60.0).scaled(0.5, 2.0);
    assert_eq!(b, BoundingBox::new(5.0, 40.0, 15.0, 120.0));
    assert_eq!(b.width(), 10.0);
    assert_eq!(b.height(), 80.0);
  }
}
