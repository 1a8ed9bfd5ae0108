// 该文件是 Poubelle 项目的一部分。
// tests/image_task.rs - 单张图像检测任务测试
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

#![cfg(feature = "image_file")]

use std::io;

use poubelle::{
  FromUrl,
  frame::RgbFrame,
  input::ImageFileInput,
  model::{BoundingBox, Detection, Detector, FillState, LabelClassifier, ReplayDetector},
  output::SaveImageFileOutput,
  task::{ImageTask, ImageTaskError, Task, Verdict},
};
use url::Url;

struct FixedDetector(Vec<Detection>);

impl Detector for FixedDetector {
  type Error = io::Error;

  fn infer(&self, _frame: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
    Ok(self.0.clone())
  }
}

struct OfflineDetector;

impl Detector for OfflineDetector {
  type Error = io::Error;

  fn infer(&self, _frame: &RgbFrame) -> Result<Vec<Detection>, Self::Error> {
    Err(io::Error::other("inference service unavailable"))
  }
}

fn bbox() -> BoundingBox {
  BoundingBox::new(4.0, 4.0, 40.0, 40.0)
}

#[test]
fn classifies_each_detection() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("annotated.png");
  let detector = FixedDetector(vec![
    Detection::new("Poubelle_Vide", 0.9, bbox()),
    Detection::new("poubelle_pleine", 0.8, bbox()),
    Detection::new("velo", 0.4, bbox()),
  ]);

  let report = ImageTask::default()
    .run_task(
      RgbFrame::with_shape(64, 64),
      detector,
      SaveImageFileOutput::new(&path),
    )
    .unwrap();

  let states: Vec<_> = report.detections.iter().map(|c| c.state).collect();
  assert_eq!(
    states,
    vec![FillState::Empty, FillState::Full, FillState::Unknown]
  );
  assert_eq!(
    report.verdicts(),
    vec![
      Verdict::Empty,
      Verdict::Full,
      Verdict::Other("velo".to_string())
    ]
  );

  let saved = image::open(&path).unwrap().to_rgb8();
  assert_eq!(RgbFrame::from(saved), report.annotated);
  assert_ne!(report.annotated, RgbFrame::with_shape(64, 64));
}

#[test]
fn no_detection_means_no_bin() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("annotated.png");
  let input = RgbFrame::with_shape(16, 8);

  let report = ImageTask::default()
    .run_task(
      input.clone(),
      FixedDetector(Vec::new()),
      SaveImageFileOutput::new(&path),
    )
    .unwrap();

  assert!(report.detections.is_empty());
  assert_eq!(report.verdicts(), vec![Verdict::NoBin]);
  assert_eq!(report.annotated, input);
  assert!(path.exists());
}

#[test]
fn custom_keywords() {
  let dir = tempfile::tempdir().unwrap();
  let report = ImageTask::default()
    .with_classifier(LabelClassifier::new(&["leer"], &["voll"]))
    .run_task(
      RgbFrame::with_shape(64, 64),
      FixedDetector(vec![Detection::new("Tonne_Voll", 0.7, bbox())]),
      SaveImageFileOutput::new(dir.path().join("out.png")),
    )
    .unwrap();

  assert_eq!(report.verdicts(), vec![Verdict::Full]);
}

#[test]
fn detector_failure_saves_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("annotated.png");

  let err = ImageTask::default()
    .run_task(
      RgbFrame::with_shape(8, 8),
      OfflineDetector,
      SaveImageFileOutput::new(&path),
    )
    .unwrap_err();

  assert!(matches!(err, ImageTaskError::Detector(_)));
  assert!(!path.exists());
}

#[test]
fn image_file_with_replayed_detections() {
  let dir = tempfile::tempdir().unwrap();
  let input_path = dir.path().join("bin.png");
  let records = dir.path().join("dets.jsonl");
  let output_path = dir.path().join("out").join("bin.png");

  image::RgbImage::from_pixel(50, 40, image::Rgb([120, 120, 120]))
    .save(&input_path)
    .unwrap();
  std::fs::write(
    &records,
    concat!(
      r#"{"frame":0,"width":100,"height":80,"detections":["#,
      r#"{"label":"poubelle_pleine","confidence":0.95,"bbox":[20.0,20.0,60.0,70.0]},"#,
      r#"{"label":"poubelle_vide","confidence":0.1,"bbox":[0.0,0.0,10.0,10.0]}]}"#,
      "\n"
    ),
  )
  .unwrap();

  let input = ImageFileInput::from_url(&Url::parse(&format!("image://{}", input_path.display())).unwrap())
    .unwrap();
  let detector = ReplayDetector::from_url(
    &Url::parse(&format!("replay://{}?confidence=0.5", records.display())).unwrap(),
  )
  .unwrap();
  let output = SaveImageFileOutput::from_url(
    &Url::parse(&format!("image://{}", output_path.display())).unwrap(),
  )
  .unwrap();

  let report = ImageTask::default()
    .run_task(input, detector, output)
    .unwrap();

  assert_eq!(report.detections.len(), 1);
  let classified = &report.detections[0];
  assert_eq!(classified.state, FillState::Full);
  // 记录尺寸 100x80，图像尺寸 50x40
  assert_eq!(classified.detection.bbox, BoundingBox::new(10.0, 10.0, 30.0, 35.0));
  assert_eq!(report.verdicts(), vec![Verdict::Full]);
  assert_eq!(image::open(&output_path).unwrap().to_rgb8().dimensions(), (50, 40));
}
