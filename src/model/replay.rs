// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/model/replay.rs - 回放预先录制的逐层输出
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

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  capture::{Activation, CaptureError, INPUT_RECORD_NAME, layer_record_name},
  model::{LayerKind, LayeredModel},
  tensor::TensorContainer,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("录制数据中缺少 {0}")]
  MissingRecord(String),
  #[error("录制数据无效: {0}")]
  InvalidRecord(#[from] CaptureError),
  #[error("第 {layer} 层的输入形状 {actual:?} 与录制的 {expected:?} 不一致")]
  InputShapeMismatch {
    layer: usize,
    expected: [u32; 4],
    actual: [u32; 4],
  },
  #[error("第 {layer} 层的输入与录制数据不一致, 最大误差 {max_abs_diff}")]
  InputDiverged { layer: usize, max_abs_diff: f32 },
  #[error("第 {0} 层超出录制范围")]
  LayerOutOfRange(usize),
}

/// 把 `layer_{i:02}` 形式的录制输出当作模型，拼接层由调用方声明。
/// 每层收到的输入都会与录制的上一层输出比对，拼接配置错误时在下一层暴露出来。
pub struct ReplayModel {
  input: Activation,
  outputs: Vec<Activation>,
  concat_layers: BTreeSet<usize>,
}

impl ReplayModel {
  pub fn new(
    container: &TensorContainer,
    concat_layers: impl IntoIterator<Item = usize>,
  ) -> Result<Self, ReplayError> {
    let input = container
      .get(INPUT_RECORD_NAME)
      .ok_or_else(|| ReplayError::MissingRecord(INPUT_RECORD_NAME.to_string()))
      .and_then(|record| Ok(Activation::try_from(record)?))?;

    let mut outputs = Vec::new();
    while let Some(record) = container.get(&layer_record_name(outputs.len())) {
      outputs.push(Activation::try_from(record)?);
    }
    if outputs.is_empty() {
      return Err(ReplayError::MissingRecord(layer_record_name(0)));
    }

    info!("回放 {} 层录制输出", outputs.len());
    Ok(Self {
      input,
      outputs,
      concat_layers: concat_layers.into_iter().collect(),
    })
  }

  /// 录制时的网络输入
  pub fn input(&self) -> &Activation {
    &self.input
  }

  pub fn recorded(&self, index: usize) -> Option<&Activation> {
    self.outputs.get(index)
  }

  fn expected_input(&self, index: usize) -> &Activation {
    match index.checked_sub(1).and_then(|prev| self.outputs.get(prev)) {
      Some(previous) => previous,
      None => &self.input,
    }
  }
}

impl LayeredModel for ReplayModel {
  type Error = ReplayError;

  fn layer_count(&self) -> usize {
    self.outputs.len()
  }

  fn layer_kind(&self, index: usize) -> LayerKind {
    if self.concat_layers.contains(&index) {
      LayerKind::Concat
    } else {
      LayerKind::Compute
    }
  }

  fn forward_layer(&mut self, index: usize, input: &Activation) -> Result<Activation, Self::Error> {
    let output = self
      .outputs
      .get(index)
      .ok_or(ReplayError::LayerOutOfRange(index))?;

    let expected = self.expected_input(index);
    if expected.shape() != input.shape() {
      return Err(ReplayError::InputShapeMismatch {
        layer: index,
        expected: expected.shape(),
        actual: input.shape(),
      });
    }
    let max_abs_diff = expected
      .data()
      .iter()
      .zip(input.data())
      .map(|(a, b)| (a - b).abs())
      .fold(0.0f32, f32::max);
    if max_abs_diff > 0.0 {
      return Err(ReplayError::InputDiverged {
        layer: index,
        max_abs_diff,
      });
    }

    debug!("回放第 {} 层, 形状 {:?}", index, output.shape());
    Ok(output.clone())
  }
}
