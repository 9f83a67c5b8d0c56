// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/tensor.rs - 张量记录与容器
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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 嵌入式加载器支持的最大维度数
pub const ENGINE_MAX_RANK: usize = 8;
/// 嵌入式加载器支持的最大名称长度（字节）
pub const ENGINE_MAX_NAME_LEN: usize = 1024;

#[derive(Error, Debug)]
pub enum TensorError {
  #[error("张量 {name} 数据长度不匹配: 形状 {shape:?} 需要 {expected} 个元素, 实际 {actual} 个")]
  ShapeMismatch {
    name: String,
    shape: Vec<u32>,
    expected: usize,
    actual: usize,
  },
  #[error("张量 {name} 的第 {axis} 维为 0")]
  ZeroDimension { name: String, axis: usize },
  #[error("张量 {0} 的元素数量溢出")]
  ElementCountOverflow(String),
  #[error("张量名称重复: {0}")]
  DuplicateName(String),
  #[error("声明了 {declared} 个张量, 实际写入 {written} 个")]
  CountMismatch { declared: u32, written: u32 },
  #[error("输入被截断: 读取 {field} (偏移 {offset}) 需要 {needed} 字节, 仅剩 {available} 字节")]
  TruncatedInput {
    field: String,
    offset: usize,
    needed: usize,
    available: usize,
  },
  #[error("头部格式错误: {field} (偏移 {offset}): {reason}")]
  MalformedHeader {
    field: String,
    offset: usize,
    reason: String,
  },
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 张量元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
  Float32,
  Uint64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
  F32(Vec<f32>),
  U64(Vec<u64>),
}

impl TensorData {
  pub fn len(&self) -> usize {
    match self {
      TensorData::F32(data) => data.len(),
      TensorData::U64(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn kind(&self) -> ElementKind {
    match self {
      TensorData::F32(_) => ElementKind::Float32,
      TensorData::U64(_) => ElementKind::Uint64,
    }
  }

  pub fn as_f32(&self) -> Option<&[f32]> {
    match self {
      TensorData::F32(data) => Some(data),
      TensorData::U64(_) => None,
    }
  }
}

/// 形状的元素总数，空形状视为标量（1 个元素）
pub fn element_count(shape: &[u32]) -> Option<usize> {
  shape
    .iter()
    .try_fold(1usize, |acc, &dim| acc.checked_mul(dim as usize))
}

/// 带名称与形状的扁平张量
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
  name: String,
  shape: Vec<u32>,
  data: TensorData,
}

impl TensorRecord {
  pub fn new(
    name: impl Into<String>,
    shape: Vec<u32>,
    data: TensorData,
  ) -> Result<Self, TensorError> {
    let name = name.into();
    if let Some(axis) = shape.iter().position(|&dim| dim == 0) {
      return Err(TensorError::ZeroDimension { name, axis });
    }
    let expected =
      element_count(&shape).ok_or_else(|| TensorError::ElementCountOverflow(name.clone()))?;
    if expected != data.len() {
      return Err(TensorError::ShapeMismatch {
        name,
        shape,
        expected,
        actual: data.len(),
      });
    }
    Ok(Self { name, shape, data })
  }

  pub fn f32(name: impl Into<String>, shape: Vec<u32>, data: Vec<f32>) -> Result<Self, TensorError> {
    Self::new(name, shape, TensorData::F32(data))
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn shape(&self) -> &[u32] {
    &self.shape
  }

  pub fn data(&self) -> &TensorData {
    &self.data
  }

  pub fn kind(&self) -> ElementKind {
    self.data.kind()
  }

  pub fn num_elements(&self) -> usize {
    self.data.len()
  }

  pub fn into_parts(self) -> (String, Vec<u32>, TensorData) {
    (self.name, self.shape, self.data)
  }
}

/// 有序的张量集合，名称唯一
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorContainer {
  records: Vec<TensorRecord>,
}

impl TensorContainer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      records: Vec::with_capacity(capacity),
    }
  }

  pub fn push(&mut self, record: TensorRecord) -> Result<(), TensorError> {
    if self.get(record.name()).is_some() {
      return Err(TensorError::DuplicateName(record.name().to_string()));
    }
    self.records.push(record);
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, TensorRecord> {
    self.records.iter()
  }

  pub fn records(&self) -> &[TensorRecord] {
    &self.records
  }

  pub fn into_records(self) -> Vec<TensorRecord> {
    self.records
  }

  pub fn get(&self, name: &str) -> Option<&TensorRecord> {
    self.records.iter().find(|record| record.name() == name)
  }

  /// 按名称查找张量；精确匹配失败时，`model.*` 会再尝试 `model.model.model.*`，
  /// 与嵌入式加载器的查找规则一致。
  pub fn find(&self, name: &str) -> Option<&TensorRecord> {
    self.get(name).or_else(|| {
      name
        .starts_with("model.")
        .then(|| format!("model.model.{}", name))
        .and_then(|alias| self.get(&alias))
    })
  }

  pub fn sort_by_name(&mut self) {
    self.records.sort_by(|a, b| a.name.cmp(&b.name));
  }
}

impl<'a> IntoIterator for &'a TensorContainer {
  type Item = &'a TensorRecord;
  type IntoIter = std::slice::Iter<'a, TensorRecord>;

  fn into_iter(self) -> Self::IntoIter {
    self.records.iter()
  }
}

impl TryFrom<Vec<TensorRecord>> for TensorContainer {
  type Error = TensorError;

  fn try_from(records: Vec<TensorRecord>) -> Result<Self, Self::Error> {
    let mut container = TensorContainer::with_capacity(records.len());
    for record in records {
      container.push(record)?;
    }
    Ok(container)
  }
}

mod codec;
pub use self::codec::{
  TensorWriter, read_container, read_container_file, write_container, write_container_file,
};

pub mod header;
