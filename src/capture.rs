// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/capture.rs - 逐层输出采集与拼接拓扑
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

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::PlanarFrame,
  model::{LayerKind, LayeredModel},
  tensor::{
    TensorContainer, TensorData, TensorError, TensorRecord, TensorWriter,
    header::{self, TestVector},
  },
  utils::{ensure_exists, write_atomically},
};

pub const INPUT_RECORD_NAME: &str = "input";

/// `layer_00`, `layer_01`, ... 按名称排序即按层序排列
pub fn layer_record_name(index: usize) -> String {
  format!("layer_{:02}", index)
}

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("第 {layer} 层是拼接层, 但拓扑配置中没有它的来源")]
  UnknownTopology { layer: usize },
  #[error("拓扑配置了第 {layer} 层, 但模型没有把它声明为拼接层")]
  NotAMergeLayer { layer: usize },
  #[error("第 {layer} 层引用了不在它之前的第 {source_layer} 层")]
  ForwardReference { layer: usize, source_layer: usize },
  #[error("第 {layer} 层没有配置任何来源")]
  EmptyMerge { layer: usize },
  #[error("第 {layer} 层拼接时形状不一致: 第 {source_layer} 层为 {actual:?}, 期望 N/H/W 与 {expected:?} 相同")]
  ConcatShapeMismatch {
    layer: usize,
    source_layer: usize,
    expected: [u32; 4],
    actual: [u32; 4],
  },
  #[error("第 {layer} 层前向计算失败: {source}")]
  Forward {
    layer: usize,
    source: Box<dyn std::error::Error + Send + Sync>,
  },
  #[error("激活数据长度不匹配: 形状 {shape:?} 需要 {expected} 个元素, 实际 {actual} 个")]
  ActivationSize {
    shape: [u32; 4],
    expected: usize,
    actual: usize,
  },
  #[error("张量 {name} 不是 NCHW float32 张量 (形状 {shape:?})")]
  NotNchw { name: String, shape: Vec<u32> },
  #[error("拓扑配置格式错误: {0}")]
  TopologyFormat(#[from] serde_json::Error),
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("张量错误: {0}")]
  TensorError(#[from] TensorError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 单个 NCHW 激活
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
  shape: [u32; 4],
  data: Vec<f32>,
}

impl Activation {
  pub fn new(shape: [u32; 4], data: Vec<f32>) -> Result<Self, CaptureError> {
    let expected = shape.iter().map(|&d| d as usize).product::<usize>();
    if expected != data.len() {
      return Err(CaptureError::ActivationSize {
        shape,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { shape, data })
  }

  pub fn shape(&self) -> [u32; 4] {
    self.shape
  }

  pub fn channels(&self) -> u32 {
    self.shape[1]
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  /// 沿通道维拼接，所有输入的 N/H/W 必须一致
  pub fn concat(parts: &[&Activation]) -> Option<Activation> {
    let first = parts.first()?;
    let [batch, _, height, width] = first.shape;
    if parts
      .iter()
      .any(|p| p.shape[0] != batch || p.shape[2] != height || p.shape[3] != width)
    {
      return None;
    }

    let channels = parts.iter().map(|p| p.shape[1]).sum();
    let total = parts.iter().map(|p| p.data.len()).sum();
    let mut data = Vec::with_capacity(total);
    for n in 0..batch as usize {
      for part in parts {
        let per_batch = part.data.len() / batch as usize;
        data.extend_from_slice(&part.data[n * per_batch..(n + 1) * per_batch]);
      }
    }
    Some(Activation {
      shape: [batch, channels, height, width],
      data,
    })
  }

  pub fn into_record(self, name: &str) -> Result<TensorRecord, TensorError> {
    TensorRecord::f32(name, self.shape.to_vec(), self.data)
  }

  pub fn as_test_vector(&self) -> TestVector<'_> {
    TestVector {
      shape: self.shape,
      values: &self.data,
    }
  }
}

impl TryFrom<&TensorRecord> for Activation {
  type Error = CaptureError;

  fn try_from(record: &TensorRecord) -> Result<Self, Self::Error> {
    let not_nchw = || CaptureError::NotNchw {
      name: record.name().to_string(),
      shape: record.shape().to_vec(),
    };
    let shape = <[u32; 4]>::try_from(record.shape()).map_err(|_| not_nchw())?;
    match record.data() {
      TensorData::F32(values) => Activation::new(shape, values.clone()),
      TensorData::U64(_) => Err(not_nchw()),
    }
  }
}

impl From<&PlanarFrame> for Activation {
  fn from(frame: &PlanarFrame) -> Self {
    Self {
      shape: frame.shape(),
      data: frame.as_slice().to_vec(),
    }
  }
}

/// 拼接层编号到来源层编号（按拼接顺序）的映射
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTopology {
  merges: BTreeMap<usize, Vec<usize>>,
}

impl LayerTopology {
  pub fn new(merges: BTreeMap<usize, Vec<usize>>) -> Self {
    Self { merges }
  }

  pub fn from_json_str(text: &str) -> Result<Self, CaptureError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn load(path: &Path) -> Result<Self, CaptureError> {
    ensure_exists(path).map_err(|e| CaptureError::MissingFile(e.0))?;
    let topology = Self::from_json_str(&std::fs::read_to_string(path)?)?;
    debug!("加载拓扑配置 {}: {:?}", path.display(), topology.merges);
    Ok(topology)
  }

  pub fn sources(&self, layer: usize) -> Option<&[usize]> {
    self.merges.get(&layer).map(Vec::as_slice)
  }

  pub fn merge_layers(&self) -> impl Iterator<Item = usize> + '_ {
    self.merges.keys().copied()
  }

  /// 在执行任何一层之前检查拓扑与模型声明是否一致
  pub fn validate<M: LayeredModel>(&self, model: &M) -> Result<(), CaptureError> {
    for (&layer, sources) in &self.merges {
      if layer >= model.layer_count() || model.layer_kind(layer) != LayerKind::Concat {
        return Err(CaptureError::NotAMergeLayer { layer });
      }
      if sources.is_empty() {
        return Err(CaptureError::EmptyMerge { layer });
      }
      if let Some(&source_layer) = sources.iter().find(|&&s| s >= layer) {
        return Err(CaptureError::ForwardReference {
          layer,
          source_layer,
        });
      }
    }
    for layer in 0..model.layer_count() {
      if model.layer_kind(layer) == LayerKind::Concat && !self.merges.contains_key(&layer) {
        return Err(CaptureError::UnknownTopology { layer });
      }
    }
    Ok(())
  }
}

/// 网络输入加上每一层的输出
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedLayers {
  pub input: Activation,
  pub outputs: Vec<Activation>,
}

impl CapturedLayers {
  pub fn into_container(self) -> Result<TensorContainer, TensorError> {
    let mut container = TensorContainer::with_capacity(self.outputs.len() + 1);
    container.push(self.input.into_record(INPUT_RECORD_NAME)?)?;
    for (index, output) in self.outputs.into_iter().enumerate() {
      container.push(output.into_record(&layer_record_name(index))?)?;
    }
    Ok(container)
  }

  /// 按容器格式逐层写出，不复制激活值
  pub fn write_container<W: Write>(&self, writer: W) -> Result<W, TensorError> {
    let mut writer = TensorWriter::new(writer, self.outputs.len() as u32 + 1)?;
    writer.write_f32(INPUT_RECORD_NAME, &self.input.shape, &self.input.data)?;
    for (index, output) in self.outputs.iter().enumerate() {
      writer.write_f32(&layer_record_name(index), &output.shape, &output.data)?;
    }
    writer.finish()
  }

  pub fn write_container_file(&self, path: &Path) -> Result<(), TensorError> {
    write_atomically(path, |file| self.write_container(file).map(|_| ()))?;
    info!("已写出 {} 层输出到 {}", self.outputs.len(), path.display());
    Ok(())
  }

  /// 以 C 头文件形式写出测试向量，`tag` 例如 `l0_23`
  pub fn write_test_vectors<W: Write>(&self, writer: &mut W, tag: &str) -> std::io::Result<()> {
    let layers: Vec<_> = self.outputs.iter().map(Activation::as_test_vector).collect();
    header::write_test_vector_header(writer, tag, self.input.as_test_vector(), &layers)
  }
}

/// 按层序执行模型：普通层的输入是上一层输出，拼接层的输出是来源层输出的通道拼接
pub fn capture<M: LayeredModel>(
  model: &mut M,
  topology: &LayerTopology,
  input: Activation,
) -> Result<CapturedLayers, CaptureError> {
  topology.validate(model)?;

  let count = model.layer_count();
  let mut outputs: Vec<Activation> = Vec::with_capacity(count);
  for layer in 0..count {
    let output = match model.layer_kind(layer) {
      LayerKind::Compute => {
        let previous = outputs.last().unwrap_or(&input);
        model
          .forward_layer(layer, previous)
          .map_err(|e| CaptureError::Forward {
            layer,
            source: Box::new(e),
          })?
      }
      LayerKind::Concat => {
        let sources = topology
          .sources(layer)
          .ok_or(CaptureError::UnknownTopology { layer })?;
        concat_sources(layer, sources, &outputs)?
      }
    };
    debug!("第 {} 层输出形状 {:?}", layer, output.shape());
    outputs.push(output);
  }

  info!("采集了 {} 层输出", outputs.len());
  Ok(CapturedLayers { input, outputs })
}

fn concat_sources(
  layer: usize,
  sources: &[usize],
  produced: &[Activation],
) -> Result<Activation, CaptureError> {
  let parts = sources
    .iter()
    .map(|&source_layer| {
      produced
        .get(source_layer)
        .ok_or(CaptureError::ForwardReference {
          layer,
          source_layer,
        })
    })
    .collect::<Result<Vec<_>, _>>()?;

  let [batch, _, height, width] = parts
    .first()
    .ok_or(CaptureError::EmptyMerge { layer })?
    .shape();
  for (&source_layer, part) in sources.iter().zip(&parts) {
    let [b, _, h, w] = part.shape();
    if (b, h, w) != (batch, height, width) {
      return Err(CaptureError::ConcatShapeMismatch {
        layer,
        source_layer,
        expected: parts[0].shape(),
        actual: part.shape(),
      });
    }
  }

  Activation::concat(&parts).ok_or(CaptureError::EmptyMerge { layer })
}
