// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use super::DrawError;
use crate::{
  detection::{DetectionList, DetectionRecord},
  utils::ensure_exists,
};

const LABEL_FONT_SIZE: f32 = 14.0;
const LABEL_OFFSET: i32 = 20;
const TITLE_POSITION: (i32, i32) = (10, 10);
const PALETTE_SIZE: usize = 80;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// 在画布上绘制检测框，字体可选
pub struct Visualizer {
  font: Option<FontArc>,
  font_scale: PxScale,
  colors: Vec<Rgb<u8>>,
}

impl Default for Visualizer {
  fn default() -> Self {
    Self::new()
  }
}

impl Visualizer {
  /// 不带字体，只画框
  pub fn new() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb(i as f32 / PALETTE_SIZE as f32 * 360.0, 0.8, 0.9))
      .collect();
    Self {
      font: None,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }

  pub fn with_font_file(path: &Path) -> Result<Self, DrawError> {
    ensure_exists(path).map_err(|e| DrawError::MissingFile(e.0))?;
    let font = FontArc::try_from_vec(std::fs::read(path)?)
      .map_err(|_| DrawError::InvalidFont(path.to_path_buf()))?;
    info!("加载字体: {}", path.display());
    Ok(Self {
      font: Some(font),
      ..Self::new()
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_for(&self, class_id: u8) -> Rgb<u8> {
    self.colors[class_id as usize % self.colors.len()]
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &DetectionList) {
    for record in detections {
      self.draw_box(image, record);
    }
  }

  fn draw_box(&self, image: &mut RgbImage, record: &DetectionRecord) {
    let color = self.color_for(record.class_id);
    let (x1, y1) = (record.x1(), record.y1());
    let width = (record.x2() - x1 + 1).max(1) as u32;
    let height = (record.y2() - y1 + 1).max(1) as u32;

    // 两像素宽的边框
    draw_hollow_rect_mut(image, Rect::at(x1, y1).of_size(width, height), color);
    if width > 2 && height > 2 {
      let inner = Rect::at(x1 + 1, y1 + 1).of_size(width - 2, height - 2);
      draw_hollow_rect_mut(image, inner, color);
    }

    if let Some(font) = &self.font {
      let label = format!("{} {:.2}", record.class_name(), record.confidence());
      let (text_w, text_h) = text_size(self.font_scale, font, &label);
      let label_y = y1 - LABEL_OFFSET;
      if text_w > 0 && text_h > 0 {
        let background = Rect::at(x1, label_y).of_size(text_w, text_h);
        draw_filled_rect_mut(image, background, color);
      }
      draw_text_mut(image, TEXT_COLOR, x1, label_y, self.font_scale, font, &label);
    }
  }

  pub fn draw_title(&self, image: &mut RgbImage, title: &str) {
    match &self.font {
      Some(font) => {
        let (x, y) = TITLE_POSITION;
        draw_text_mut(image, TEXT_COLOR, x, y, self.font_scale, font, title);
      }
      None => warn!("没有字体, 跳过标题 \"{}\"", title),
    }
  }

  pub fn render(
    &self,
    mut canvas: RgbImage,
    detections: &DetectionList,
    title: Option<&str>,
  ) -> RgbImage {
    self.draw_detections(&mut canvas, detections);
    if let Some(title) = title {
      self.draw_title(&mut canvas, title);
    }
    canvas
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
