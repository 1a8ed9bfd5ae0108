// 该文件是 Poubelle 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use thiserror::Error;

use crate::{
  frame::RgbFrame,
  model::{Detection, FillState, LabelClassifier},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_TEXT_HORIZONTAL_PADDING: i32 = 4;
const BOX_THICKNESS: i32 = 2;

const EMPTY_COLOR: [u8; 3] = [0, 200, 0]; // 绿色
const FULL_COLOR: [u8; 3] = [255, 190, 0]; // 黄色
const UNKNOWN_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体加载错误: {0}")]
  FontLoadError(#[from] ab_glyph::InvalidFont),
}

/// 检测框绘制
///
/// 框的颜色由标签对应的 [`FillState`] 决定。未设置字体时只绘制边框，不绘制标签文本。
pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_text_vertical_padding: i32,
  thickness: i32,
  font: Option<FontArc>,
  classifier: LabelClassifier,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      thickness: BOX_THICKNESS,
      font: None,
      classifier: LabelClassifier::default(),
    }
  }
}

impl Draw {
  pub fn with_font(mut self, font: FontArc) -> Self {
    self.font = Some(font);
    self
  }

  pub fn with_font_file(self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)?;
    Ok(self.with_font(font))
  }

  pub fn with_classifier(mut self, classifier: LabelClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  pub fn with_thickness(mut self, thickness: i32) -> Self {
    self.thickness = thickness.max(1);
    self
  }

  pub fn color_of(state: FillState) -> [u8; 3] {
    match state {
      FillState::Empty => EMPTY_COLOR,
      FillState::Full => FULL_COLOR,
      FillState::Unknown => UNKNOWN_COLOR,
    }
  }

  // 在图像上绘制一个矩形边框，bbox 为像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    if image.width() == 0 || image.height() == 0 {
      return;
    }

    let (w, h) = (image.width() as i32, image.height() as i32);
    let color = Self::color_of(self.classifier.classify(&detection.label));
    let bbox = &detection.bbox;

    // Clamp to image bounds
    let x_min = (bbox.x_min.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y_min.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x_max.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y_max.ceil() as i32).clamp(0, h - 1);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..self.thickness {
      let x_min_t = x_min + t;
      let y_min_t = y_min + t;
      let x_max_t = x_max - t;
      let y_max_t = y_max - t;
      if x_min_t > x_max_t || y_min_t > y_max_t {
        break;
      }

      // Top and bottom edges
      for x in x_min_t..=x_max_t {
        image.put_pixel(x as u32, y_min_t as u32, Rgb(color));
        image.put_pixel(x as u32, y_max_t as u32, Rgb(color));
      }

      // Left and right edges
      for y in y_min_t..=y_max_t {
        image.put_pixel(x_min_t as u32, y as u32, Rgb(color));
        image.put_pixel(x_max_t as u32, y as u32, Rgb(color));
      }
    }

    let Some(font) = self.font.as_ref() else {
      return;
    };

    let label = format!("{} {:.2}", detection.label, detection.confidence);
    let scale = PxScale::from(self.font_size);
    let (text_width, _) = text_size(scale, font, &label);

    // 标签背景放在边框上方，放不下时贴住图像顶部
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let max_width = w - label_x;
    let label_width = (text_width as i32 + 2 * LABEL_TEXT_HORIZONTAL_PADDING).min(max_width);
    let label_height = self.label_text_height.min(h - label_y);

    if label_width > 0 && label_height > 0 {
      let rect = Rect::at(label_x, label_y).of_size(label_width as u32, label_height as u32);
      draw_filled_rect_mut(image, rect, Rgb(color));

      draw_text_mut(
        image,
        Rgb([255u8, 255u8, 255u8]),
        label_x + LABEL_TEXT_HORIZONTAL_PADDING,
        label_y + self.label_text_vertical_padding,
        scale,
        font,
        &label,
      );
    }
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      self.draw_bbox_with_label(image, detection);
    }
  }

  /// 在帧的副本上绘制检测结果
  pub fn draw_detection(&self, frame: &RgbFrame, detections: &[Detection]) -> RgbFrame {
    if detections.is_empty() {
      return frame.clone();
    }

    let mut image = frame.to_rgb_image();
    self.draw_detections_on_image(&mut image, detections);
    RgbFrame::from(image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::BoundingBox;

  fn det(label: &str, bbox: [f32; 4]) -> Detection {
    Detection::new(label, 0.9, BoundingBox::from(bbox))
  }

  #[test]
  fn no_detections_is_identity() {
    let mut frame = RgbFrame::with_shape(8, 8);
    frame.as_mut()[5] = 77;
    let out = Draw::default().draw_detection(&frame, &[]);
    assert_eq!(out, frame);
  }

  #[test]
  fn box_colour_follows_fill_state() {
    let frame = RgbFrame::with_shape(40, 40);
    let out = Draw::default().draw_detection(
      &frame,
      &[
        det("poubelle_vide", [2.0, 2.0, 10.0, 10.0]),
        det("poubelle_pleine", [20.0, 20.0, 30.0, 30.0]),
      ],
    );
    let image = out.to_rgb_image();
    assert_eq!(image.get_pixel(2, 2), &Rgb(EMPTY_COLOR));
    assert_eq!(image.get_pixel(10, 10), &Rgb(EMPTY_COLOR));
    assert_eq!(image.get_pixel(20, 25), &Rgb(FULL_COLOR));
    // 框内部保持不变
    assert_eq!(image.get_pixel(6, 6), &Rgb([0, 0, 0]));
    assert_eq!(out.dimensions(), frame.dimensions());
  }

  #[test]
  fn out_of_bounds_box_is_clamped() {
    let frame = RgbFrame::with_shape(16, 16);
    let out = Draw::default().draw_detection(&frame, &[det("cat", [-5.0, -5.0, 100.0, 100.0])]);
    let image = out.to_rgb_image();
    assert_eq!(image.get_pixel(0, 0), &Rgb(UNKNOWN_COLOR));
    assert_eq!(image.get_pixel(15, 15), &Rgb(UNKNOWN_COLOR));
  }

  #[test]
  fn degenerate_inputs_do_not_panic() {
    let empty = RgbFrame::with_shape(0, 0);
    let out = Draw::default().draw_detection(&empty, &[det("vide", [0.0, 0.0, 1.0, 1.0])]);
    assert_eq!(out.dimensions(), (0, 0));

    let frame = RgbFrame::with_shape(10, 10);
    let out = Draw::default().draw_detection(&frame, &[det("vide", [5.0, 5.0, 5.0, 9.0])]);
    assert_eq!(out, frame);
  }
}
