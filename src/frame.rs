// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/frame.rs - 平面 RGB 浮点帧定义
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

use image::{Rgb, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
pub struct FrameSizeMismatch {
  pub expected: usize,
  pub actual: usize,
}

/// 平面存储的 RGB 帧，取值范围 `[0, 1]`，通道内按行优先排列
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarFrame {
  width: u32,
  height: u32,
  data: Box<[f32]>,
}

impl PlanarFrame {
  pub fn filled(width: u32, height: u32, value: [f32; RGB_CHANNELS]) -> Self {
    let plane = width as usize * height as usize;
    let mut data = Vec::with_capacity(RGB_CHANNELS * plane);
    for channel in value {
      data.extend(std::iter::repeat_n(channel, plane));
    }
    Self {
      width,
      height,
      data: data.into_boxed_slice(),
    }
  }

  pub fn from_vec(width: u32, height: u32, data: Vec<f32>) -> Result<Self, FrameSizeMismatch> {
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameSizeMismatch {
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

  /// NCHW 形状，批次固定为 1
  pub fn shape(&self) -> [u32; 4] {
    [1, RGB_CHANNELS as u32, self.height, self.width]
  }

  pub fn pixel(&self, x: u32, y: u32) -> [f32; RGB_CHANNELS] {
    let plane = self.width as usize * self.height as usize;
    let offset = y as usize * self.width as usize + x as usize;
    [
      self.data[offset],
      self.data[plane + offset],
      self.data[2 * plane + offset],
    ]
  }

  /// 以 `(x, y)` 为左上角覆盖写入一张图像，超出边界的部分被裁掉
  pub fn paste(&mut self, image: &RgbImage, x: u32, y: u32) {
    let plane = self.width as usize * self.height as usize;
    let (src_w, src_h) = image.dimensions();
    for sy in 0..src_h.min(self.height.saturating_sub(y)) {
      for sx in 0..src_w.min(self.width.saturating_sub(x)) {
        let pixel = image.get_pixel(sx, sy);
        let offset = (y + sy) as usize * self.width as usize + (x + sx) as usize;
        for c in 0..RGB_CHANNELS {
          self.data[c * plane + offset] = pixel[c] as f32 / 255.0;
        }
      }
    }
  }

  pub fn to_rgb_image(&self) -> RgbImage {
    RgbImage::from_fn(self.width, self.height, |x, y| {
      let [r, g, b] = self.pixel(x, y);
      Rgb([to_u8(r), to_u8(g), to_u8(b)])
    })
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data.into_vec()
  }
}

fn to_u8(value: f32) -> u8 {
  (value * 255.0).round().clamp(0.0, 255.0) as u8
}

impl From<&RgbImage> for PlanarFrame {
  fn from(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let mut frame = PlanarFrame::filled(width, height, [0.0; RGB_CHANNELS]);
    frame.paste(image, 0, 0);
    frame
  }
}
