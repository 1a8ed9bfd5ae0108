// 该文件是 Poubelle 项目的一部分。
// src/task.rs - 检测任务
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Instant,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::RgbFrame,
  input::{OpenVideo, VideoSource},
  model::{Detection, Detector, FillState, LabelClassifier},
  output::{
    EncoderConfig, OpenSink, OutputVideo, SaveFrame, SinkSettings, VideoSink,
    draw::Draw,
    record::{DetectionRecord, RecordError},
  },
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("无法打开视频源: {0}")]
  SourceOpen(#[source] BoxError),
  #[error("无效的视频尺寸: {width}x{height}")]
  InvalidDimensions { width: u32, height: u32 },
  #[error("无法初始化编码器: {0}")]
  EncoderInit(String),
  #[error("输出视频为空: {}", .0.display())]
  EmptyOutput(PathBuf),
  #[error("第 {frame} 帧检测失败: {source}")]
  Detector {
    frame: u64,
    #[source]
    source: BoxError,
  },
  #[error("第 {frame} 帧写入失败: {source}")]
  Write {
    frame: u64,
    #[source]
    source: BoxError,
  },
  #[error("检测记录错误: {0}")]
  Record(#[from] RecordError),
  #[error("任务已取消，已写入 {0} 帧")]
  Cancelled(u64),
}

/// 处理进度，仅供参考
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
  pub processed: u64,
  /// 视频源报告的帧数估计，可能未知
  pub total: Option<u64>,
}

impl Progress {
  /// 总帧数未知或为 0 时返回 `None`
  pub fn fraction(&self) -> Option<f64> {
    match self.total {
      Some(total) if total > 0 => Some((self.processed as f64 / total as f64).min(1.0)),
      _ => None,
    }
  }
}

/// 视频标注任务
///
/// 逐帧读取视频源，推理、绘制检测结果并写入编码器。主编码格式不可用时
/// 改用备用格式。任何失败都会删除未完成的输出文件。
pub struct AnnotateTask {
  config: EncoderConfig,
  inference_size: Option<(u32, u32)>,
  max_frames: Option<u64>,
  record: Option<DetectionRecord>,
  cancel: Option<Arc<AtomicBool>>,
  draw: Option<Draw>,
  progress: Option<Box<dyn FnMut(Progress)>>,
}

impl AnnotateTask {
  pub fn new(config: EncoderConfig) -> Self {
    Self {
      config,
      inference_size: None,
      max_frames: None,
      record: None,
      cancel: None,
      draw: None,
      progress: None,
    }
  }

  /// 推理前把帧缩放到指定尺寸，检测框再映射回原始帧
  pub fn with_inference_size(mut self, size: Option<(u32, u32)>) -> Self {
    self.inference_size = size.filter(|(w, h)| *w > 0 && *h > 0);
    self
  }

  /// 最多处理的帧数，达到后正常结束
  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  /// 逐帧写入检测记录，任务失败时保留已写入的记录
  pub fn with_record(mut self, record: DetectionRecord) -> Self {
    self.record = Some(record);
    self
  }

  pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
    self.cancel = Some(cancel);
    self
  }

  /// 使用指定的绘制方式代替 [`Detector::render`]
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = Some(draw);
    self
  }

  pub fn with_progress(mut self, progress: impl FnMut(Progress) + 'static) -> Self {
    self.progress = Some(Box::new(progress));
    self
  }

  fn is_cancelled(&self) -> bool {
    self
      .cancel
      .as_ref()
      .is_some_and(|flag| flag.load(Ordering::SeqCst))
  }

  fn report(&mut self, progress: Progress) {
    if let Some(callback) = self.progress.as_mut() {
      callback(progress);
    }
  }

  fn open_sink<O: OpenSink>(
    &self,
    sinks: &O,
    width: u32,
    height: u32,
    fps: f64,
  ) -> Result<(O::Sink, SinkSettings), PipelineError> {
    let mut failures = Vec::new();
    for codec in self.config.candidates() {
      let settings = SinkSettings {
        path: self.config.path_for(codec),
        codec,
        width,
        height,
        fps,
      };
      // 只清理本次运行创建的文件
      let existed = settings.path.exists();
      match sinks.open_sink(&settings) {
        Ok(sink) => {
          if !failures.is_empty() {
            warn!("主编码格式不可用，改用备用格式 {}", codec);
          }
          return Ok((sink, settings));
        }
        Err(e) => {
          warn!("无法打开编码器 {} ({}): {}", codec, settings.path.display(), e);
          if !existed {
            remove_artifact(&settings.path);
          }
          failures.push(format!("{}: {}", codec, e));
        }
      }
    }

    Err(PipelineError::EncoderInit(failures.join("; ")))
  }

  fn stream<V: VideoSource, D: Detector, K: VideoSink>(
    &mut self,
    video: V,
    detector: &D,
    mut sink: K,
    settings: &SinkSettings,
  ) -> Result<u64, PipelineError> {
    let total = match (video.info().frame_count, self.max_frames) {
      (Some(count), Some(max)) => Some(count.min(max)),
      (count, None) => count,
      (None, Some(max)) => Some(max),
    };
    let mut record = self.record.take();
    if let Some(record) = &record {
      debug!("检测记录: {}", record.path().display());
    }

    let mut written = 0u64;
    let started = Instant::now();
    for frame in video {
      if self.max_frames.is_some_and(|max| written >= max) {
        info!("达到指定帧数 {}，结束处理", written);
        break;
      }
      if self.is_cancelled() {
        warn!("任务已取消，已写入 {} 帧", written);
        return Err(PipelineError::Cancelled(written));
      }

      let now = Instant::now();
      let detections = self.detect(detector, &frame, written)?;
      if let Some(record) = record.as_mut() {
        record.record(written, frame.dimensions(), &detections)?;
      }

      let annotated = match &self.draw {
        Some(draw) => draw.draw_detection(&frame, &detections),
        None => detector.render(&frame, &detections),
      };
      let annotated = if annotated.dimensions() != (settings.width, settings.height) {
        annotated.resized(settings.width, settings.height)
      } else {
        annotated
      };

      sink
        .write_frame(&annotated)
        .map_err(|e| PipelineError::Write {
          frame: written,
          source: Box::new(e),
        })?;
      debug!(
        "第 {} 帧完成: {} 个目标，耗时 {:.2?}",
        written,
        detections.len(),
        now.elapsed()
      );

      written += 1;
      self.report(Progress {
        processed: written,
        total,
      });
    }

    if written == 0 {
      return Err(PipelineError::EmptyOutput(settings.path.clone()));
    }

    sink.finish().map_err(|e| PipelineError::Write {
      frame: written,
      source: Box::new(e),
    })?;
    if let Some(record) = record {
      record.finish()?;
    }

    info!("处理完成: {} 帧，耗时 {:.2?}", written, started.elapsed());
    Ok(written)
  }

  /// 推理，检测框坐标对应原始帧
  fn detect<D: Detector>(
    &self,
    detector: &D,
    frame: &RgbFrame,
    index: u64,
  ) -> Result<Vec<Detection>, PipelineError> {
    let wrap = |e: D::Error| PipelineError::Detector {
      frame: index,
      source: Box::new(e),
    };

    match self.inference_size {
      Some((width, height)) if (width, height) != frame.dimensions() => {
        let scaled = frame.resized(width, height);
        let sx = frame.width() as f32 / width as f32;
        let sy = frame.height() as f32 / height as f32;
        Ok(
          detector
            .infer(&scaled)
            .map_err(wrap)?
            .into_iter()
            .map(|d| Detection {
              bbox: d.bbox.scaled(sx, sy),
              ..d
            })
            .collect(),
        )
      }
      _ => detector.infer(frame).map_err(wrap),
    }
  }
}

impl<S: OpenVideo, D: Detector, O: OpenSink> Task<S, D, O> for AnnotateTask {
  type Output = OutputVideo;
  type Error = PipelineError;

  fn run_task(mut self, source: S, detector: D, sinks: O) -> Result<OutputVideo, PipelineError> {
    if !self.config.has_valid_size() {
      return Err(PipelineError::InvalidDimensions {
        width: self.config.width.unwrap_or_default(),
        height: self.config.height.unwrap_or_default(),
      });
    }

    info!("开始任务...");
    let video = source
      .open_video()
      .map_err(|e| PipelineError::SourceOpen(Box::new(e)))?;
    let info = video.info();

    // 配置未指定尺寸时才依赖视频源报告的尺寸
    let (width, height) = self.config.resolve_size((info.width, info.height));
    if width == 0 || height == 0 {
      return Err(PipelineError::InvalidDimensions { width, height });
    }
    let fps = match self.config.valid_fps() {
      Some(fps) => fps,
      None => {
        if info.fps != Some(info.effective_fps()) {
          warn!("视频源帧率无效 ({:?})，使用 {} fps", info.fps, info.effective_fps());
        }
        info.effective_fps()
      }
    };
    info!(
      "视频源: {}x{}，帧数 {:?}；输出: {}x{} @ {} fps",
      info.width, info.height, info.frame_count, width, height, fps
    );

    let (sink, settings) = self.open_sink(&sinks, width, height, fps)?;
    let frame_count = match self.stream(video, &detector, sink, &settings) {
      Ok(count) => count,
      Err(e) => {
        remove_artifact(&settings.path);
        return Err(e);
      }
    };

    let byte_len = std::fs::metadata(&settings.path)
      .map(|meta| meta.len())
      .unwrap_or(0);
    if byte_len == 0 {
      remove_artifact(&settings.path);
      return Err(PipelineError::EmptyOutput(settings.path));
    }

    info!(
      "输出视频: {} ({}，{} 字节)",
      settings.path.display(),
      settings.codec,
      byte_len
    );
    Ok(OutputVideo {
      path: settings.path,
      codec: settings.codec,
      width,
      height,
      fps,
      frame_count,
      byte_len,
    })
  }
}

/// 以默认选项运行 [`AnnotateTask`]
pub fn annotate<S: OpenVideo, D: Detector, O: OpenSink>(
  source: S,
  detector: D,
  config: EncoderConfig,
  sinks: O,
) -> Result<OutputVideo, PipelineError> {
  AnnotateTask::new(config).run_task(source, detector, sinks)
}

fn remove_artifact(path: &Path) {
  match std::fs::remove_file(path) {
    Ok(()) => debug!("已删除未完成的输出: {}", path.display()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => warn!("无法删除未完成的输出 {}: {}", path.display(), e),
  }
}

#[derive(Error, Debug)]
pub enum ImageTaskError {
  #[error("检测失败: {0}")]
  Detector(#[source] BoxError),
  #[error("保存图像失败: {0}")]
  Output(#[source] BoxError),
}

/// 单张图像的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
  NoBin,
  Empty,
  Full,
  /// 其他物体，附带原始标签
  Other(String),
}

impl std::fmt::Display for Verdict {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Verdict::NoBin => write!(f, "未检测到垃圾桶"),
      Verdict::Empty => write!(f, "检测到空垃圾桶"),
      Verdict::Full => write!(f, "检测到满垃圾桶"),
      Verdict::Other(label) => write!(f, "检测到其他物体: {}", label),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedDetection {
  pub detection: Detection,
  pub state: FillState,
}

#[derive(Debug, Clone)]
pub struct ImageReport {
  pub detections: Vec<ClassifiedDetection>,
  pub annotated: RgbFrame,
}

impl ImageReport {
  /// 没有检测结果时只有 [`Verdict::NoBin`]，否则每个检测结果一条
  pub fn verdicts(&self) -> Vec<Verdict> {
    if self.detections.is_empty() {
      return vec![Verdict::NoBin];
    }
    self
      .detections
      .iter()
      .map(|c| match c.state {
        FillState::Empty => Verdict::Empty,
        FillState::Full => Verdict::Full,
        FillState::Unknown => Verdict::Other(c.detection.label.clone()),
      })
      .collect()
  }
}

/// 单张图像检测任务
#[derive(Default)]
pub struct ImageTask {
  classifier: LabelClassifier,
  draw: Option<Draw>,
}

impl ImageTask {
  pub fn with_classifier(mut self, classifier: LabelClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  /// 使用指定的绘制方式代替 [`Detector::render`]
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = Some(draw);
    self
  }
}

impl<I: Into<RgbFrame>, D: Detector, O: SaveFrame> Task<I, D, O> for ImageTask {
  type Output = ImageReport;
  type Error = ImageTaskError;

  fn run_task(self, input: I, detector: D, output: O) -> Result<ImageReport, ImageTaskError> {
    let frame = input.into();
    info!("开始推理...");
    let now = Instant::now();
    let detections = detector
      .infer(&frame)
      .map_err(|e| ImageTaskError::Detector(Box::new(e)))?;
    info!("推理完成: {} 个目标，耗时 {:.2?}", detections.len(), now.elapsed());

    let annotated = match &self.draw {
      Some(draw) => draw.draw_detection(&frame, &detections),
      None => detector.render(&frame, &detections),
    };
    output
      .save_frame(&annotated)
      .map_err(|e| ImageTaskError::Output(Box::new(e)))?;

    let detections = detections
      .into_iter()
      .map(|detection| ClassifiedDetection {
        state: self.classifier.classify(&detection.label),
        detection,
      })
      .collect();

    Ok(ImageReport {
      detections,
      annotated,
    })
  }
}
