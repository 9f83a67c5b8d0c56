// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/model.rs - 模型接口：逐层前向与检测后处理
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

use crate::{capture::Activation, letterbox::PreprocessedImage};

/// 层的类型，由模型自己声明
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
  /// 输入是上一层的输出
  Compute,
  /// 输入是若干前序层输出在通道维上的拼接
  Concat,
}

/// 可以逐层执行的网络
pub trait LayeredModel {
  type Error: std::error::Error + Send + Sync + 'static;

  fn layer_count(&self) -> usize;
  fn layer_kind(&self, index: usize) -> LayerKind;

  /// 只会对 `LayerKind::Compute` 的层调用
  fn forward_layer(&mut self, index: usize, input: &Activation) -> Result<Activation, Self::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [center_x, center_y, width, height]，画布像素
}

/// 不透明的检测后处理器
pub trait Detector {
  type Error;

  fn detect(&mut self, image: &PreprocessedImage) -> Result<Vec<DetectItem>, Self::Error>;
}

mod replay;
pub use self::replay::{ReplayError, ReplayModel};
