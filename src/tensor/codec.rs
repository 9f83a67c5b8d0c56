// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/tensor/codec.rs - 张量容器二进制编解码
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

//! 布局（全部小端，无对齐填充）：
//!
//! ```text
//! u32 tensor_count
//! repeat tensor_count:
//!   u32 name_len | name bytes | u32 rank | u32 shape[rank] | f32 payload[product(shape)]
//! ```

use std::io::{Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use super::{TensorContainer, TensorData, TensorError, TensorRecord, element_count};
use crate::utils::{ensure_exists, write_atomically};

const U32_SIZE: usize = 4;
const F32_SIZE: usize = 4;
// name_len + rank + 标量负载
const MIN_RECORD_SIZE: usize = U32_SIZE + U32_SIZE + F32_SIZE;

/// 逐条写入张量，不需要先在内存里拼出整个容器
pub struct TensorWriter<W: Write> {
  inner: W,
  declared: u32,
  written: u32,
}

impl<W: Write> TensorWriter<W> {
  pub fn new(mut inner: W, tensor_count: u32) -> Result<Self, TensorError> {
    inner.write_u32::<LittleEndian>(tensor_count)?;
    Ok(Self {
      inner,
      declared: tensor_count,
      written: 0,
    })
  }

  pub fn write_record(&mut self, record: &TensorRecord) -> Result<(), TensorError> {
    self.write_tensor(record.name(), record.shape(), record.data())
  }

  pub fn write_tensor(
    &mut self,
    name: &str,
    shape: &[u32],
    data: &TensorData,
  ) -> Result<(), TensorError> {
    self.begin_record(name, shape)?;
    match data {
      TensorData::F32(values) => self.write_values(values)?,
      TensorData::U64(values) => {
        // 引擎只读取 float32
        debug!("张量 {} 为 uint64, 按 float32 写出", name);
        for &value in values {
          self.inner.write_f32::<LittleEndian>(value as f32)?;
        }
      }
    }
    self.written += 1;
    Ok(())
  }

  /// 直接写出借用的 float32 数据，调用方不必先构造 `TensorRecord`
  pub fn write_f32(&mut self, name: &str, shape: &[u32], values: &[f32]) -> Result<(), TensorError> {
    self.begin_record(name, shape)?;
    self.write_values(values)?;
    self.written += 1;
    Ok(())
  }

  fn begin_record(&mut self, name: &str, shape: &[u32]) -> Result<(), TensorError> {
    if self.written >= self.declared {
      return Err(TensorError::CountMismatch {
        declared: self.declared,
        written: self.written + 1,
      });
    }

    let name_len = u32::try_from(name.len()).map_err(|_| TensorError::MalformedHeader {
      field: format!("tensor {} name", self.written),
      offset: 0,
      reason: format!("名称长度 {} 超出 u32 范围", name.len()),
    })?;
    self.inner.write_u32::<LittleEndian>(name_len)?;
    self.inner.write_all(name.as_bytes())?;

    self.inner.write_u32::<LittleEndian>(shape.len() as u32)?;
    for &dim in shape {
      self.inner.write_u32::<LittleEndian>(dim)?;
    }
    Ok(())
  }

  fn write_values(&mut self, values: &[f32]) -> std::io::Result<()> {
    for &value in values {
      self.inner.write_f32::<LittleEndian>(value)?;
    }
    Ok(())
  }

  pub fn finish(mut self) -> Result<W, TensorError> {
    if self.written != self.declared {
      return Err(TensorError::CountMismatch {
        declared: self.declared,
        written: self.written,
      });
    }
    self.inner.flush()?;
    Ok(self.inner)
  }
}

pub fn write_container<W: Write>(
  writer: W,
  container: &TensorContainer,
) -> Result<W, TensorError> {
  let mut writer = TensorWriter::new(writer, container.len() as u32)?;
  for record in container {
    writer.write_record(record)?;
  }
  writer.finish()
}

pub fn write_container_file(
  path: impl AsRef<Path>,
  container: &TensorContainer,
) -> Result<(), TensorError> {
  let path = path.as_ref();
  write_atomically(path, |file| write_container(file, container).map(|_| ()))?;
  info!("已写出 {} 个张量到 {}", container.len(), path.display());
  Ok(())
}

struct ByteReader<'a> {
  cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteReader<'a> {
  fn new(bytes: &'a [u8]) -> Self {
    Self {
      cursor: Cursor::new(bytes),
    }
  }

  fn offset(&self) -> usize {
    self.cursor.position() as usize
  }

  fn remaining(&self) -> usize {
    self.cursor.get_ref().len() - self.offset()
  }

  fn require(&self, field: impl FnOnce() -> String, needed: usize) -> Result<(), TensorError> {
    if self.remaining() < needed {
      return Err(TensorError::TruncatedInput {
        field: field(),
        offset: self.offset(),
        needed,
        available: self.remaining(),
      });
    }
    Ok(())
  }

  fn malformed(&self, field: String, reason: String) -> TensorError {
    TensorError::MalformedHeader {
      field,
      offset: self.offset(),
      reason,
    }
  }

  fn read_u32(&mut self, field: impl FnOnce() -> String) -> Result<u32, TensorError> {
    self.require(field, U32_SIZE)?;
    Ok(self.cursor.read_u32::<LittleEndian>()?)
  }
}

/// 从完整的字节缓冲区解析张量容器。任何截断或不一致都是致命错误，不返回部分结果。
pub fn read_container(bytes: &[u8]) -> Result<TensorContainer, TensorError> {
  let mut reader = ByteReader::new(bytes);

  let tensor_count = reader.read_u32(|| "tensor_count".to_string())?;
  let max_records = reader.remaining() / MIN_RECORD_SIZE;
  if tensor_count as usize > max_records {
    return Err(reader.malformed(
      "tensor_count".to_string(),
      format!(
        "声明 {} 个张量, 剩余 {} 字节最多容纳 {} 个",
        tensor_count,
        reader.remaining(),
        max_records
      ),
    ));
  }

  let mut container = TensorContainer::with_capacity(tensor_count as usize);
  for index in 0..tensor_count {
    let start = reader.offset();
    let record = read_record(&mut reader, index)?;
    if container.get(record.name()).is_some() {
      return Err(TensorError::MalformedHeader {
        field: format!("tensor {} name", index),
        offset: start,
        reason: format!("名称 {} 与之前的张量重复", record.name()),
      });
    }
    debug!("读取张量 {}: {:?}", record.name(), record.shape());
    container.push(record)?;
  }

  if reader.remaining() != 0 {
    return Err(reader.malformed(
      "tensor_count".to_string(),
      format!("读取 {} 个张量后仍剩余 {} 字节", tensor_count, reader.remaining()),
    ));
  }

  Ok(container)
}

fn read_record(reader: &mut ByteReader<'_>, index: u32) -> Result<TensorRecord, TensorError> {
  let name_len = reader.read_u32(|| format!("tensor {} name_length", index))? as usize;
  reader.require(|| format!("tensor {} name", index), name_len)?;
  let mut name_bytes = vec![0u8; name_len];
  reader.cursor.read_exact(&mut name_bytes)?;
  let name = String::from_utf8(name_bytes).map_err(|e| {
    reader.malformed(format!("tensor {} name", index), format!("名称不是合法 UTF-8: {}", e))
  })?;

  let rank = reader.read_u32(|| format!("tensor {} ({}) rank", index, name))? as usize;
  let shape_bytes = rank.checked_mul(U32_SIZE).and_then(|n| n.checked_add(F32_SIZE));
  if shape_bytes.is_none_or(|needed| needed > reader.remaining()) {
    return Err(reader.malformed(
      format!("tensor {} ({}) rank", index, name),
      format!("维度数 {} 与剩余 {} 字节不符", rank, reader.remaining()),
    ));
  }

  let mut shape = Vec::with_capacity(rank);
  for axis in 0..rank {
    let dim = reader.read_u32(|| format!("tensor {} ({}) shape[{}]", index, name, axis))?;
    if dim == 0 {
      return Err(reader.malformed(
        format!("tensor {} ({}) shape[{}]", index, name, axis),
        "维度为 0".to_string(),
      ));
    }
    shape.push(dim);
  }

  let payload_bytes = element_count(&shape).and_then(|n| n.checked_mul(F32_SIZE));
  let payload_bytes = match payload_bytes {
    Some(bytes) if bytes <= reader.remaining() => bytes,
    _ => {
      return Err(reader.malformed(
        format!("tensor {} ({}) shape", index, name),
        format!("形状 {:?} 的数据超出剩余 {} 字节", shape, reader.remaining()),
      ));
    }
  };

  let mut data = vec![0f32; payload_bytes / F32_SIZE];
  reader.cursor.read_f32_into::<LittleEndian>(&mut data)?;

  TensorRecord::f32(name, shape, data)
}

pub fn read_container_file(path: impl AsRef<Path>) -> Result<TensorContainer, TensorError> {
  let path = path.as_ref();
  ensure_exists(path).map_err(|_| TensorError::MissingFile(path.to_path_buf()))?;
  let bytes = std::fs::read(path)?;
  debug!("读取权重文件 {} ({} 字节)", path.display(), bytes.len());
  read_container(&bytes)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_container() -> TensorContainer {
    let records = vec![
      TensorRecord::f32(
        "model.0.conv.weight",
        vec![2, 1, 2, 2],
        vec![0.5, -1.25, 3.0e-8, f32::MAX, f32::MIN_POSITIVE, -0.0, 7.0, 1.0e10],
      )
      .unwrap(),
      TensorRecord::f32("model.0.conv.bias", vec![2], vec![0.1, -0.2]).unwrap(),
      TensorRecord::f32("scalar", vec![], vec![42.0]).unwrap(),
    ];
    TensorContainer::try_from(records).unwrap()
  }

  fn encode(container: &TensorContainer) -> Vec<u8> {
    write_container(Vec::new(), container).unwrap()
  }

  #[test]
  fn round_trip_is_bit_exact() {
    let container = sample_container();
    let decoded = read_container(&encode(&container)).unwrap();
    assert_eq!(decoded.len(), container.len());
    for (a, b) in decoded.iter().zip(container.iter()) {
      assert_eq!(a.name(), b.name());
      assert_eq!(a.shape(), b.shape());
      let bits_a: Vec<u32> = a.data().as_f32().unwrap().iter().map(|v| v.to_bits()).collect();
      let bits_b: Vec<u32> = b.data().as_f32().unwrap().iter().map(|v| v.to_bits()).collect();
      assert_eq!(bits_a, bits_b);
    }
  }

  #[test]
  fn layout_is_packed_little_endian() {
    let container =
      TensorContainer::try_from(vec![TensorRecord::f32("ab", vec![1], vec![1.0]).unwrap()])
        .unwrap();
    let bytes = encode(&container);
    let mut expected = Vec::new();
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.extend_from_slice(b"ab");
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&1u32.to_le_bytes());
    expected.extend_from_slice(&1.0f32.to_le_bytes());
    assert_eq!(bytes, expected);
  }

  #[test]
  fn empty_container_is_four_bytes() {
    let bytes = encode(&TensorContainer::new());
    assert_eq!(bytes, vec![0, 0, 0, 0]);
    assert!(read_container(&bytes).unwrap().is_empty());
  }

  #[test]
  fn uint64_is_written_as_float32() {
    let record = TensorRecord::new(
      "model.1.bn.num_batches_tracked",
      vec![],
      TensorData::U64(vec![12345]),
    )
    .unwrap();
    let container = TensorContainer::try_from(vec![record]).unwrap();
    let decoded = read_container(&encode(&container)).unwrap();
    assert_eq!(decoded.records()[0].data(), &TensorData::F32(vec![12345.0]));
  }

  #[test]
  fn missing_count_is_truncation() {
    let err = read_container(&[1, 0]).unwrap_err();
    assert!(matches!(
      err,
      TensorError::TruncatedInput {
        needed: 4,
        available: 2,
        ..
      }
    ));
  }

  #[test]
  fn oversized_count_is_malformed() {
    let mut bytes = encode(&sample_container());
    bytes[0..4].copy_from_slice(&1000u32.to_le_bytes());
    let err = read_container(&bytes).unwrap_err();
    assert!(matches!(err, TensorError::MalformedHeader { ref field, .. } if field == "tensor_count"));
  }

  #[test]
  fn oversized_name_is_truncation() {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&100u32.to_le_bytes());
    bytes.extend_from_slice(b"short name");
    let err = read_container(&bytes).unwrap_err();
    assert!(matches!(err, TensorError::TruncatedInput { needed: 100, .. }));
  }

  #[test]
  fn shape_larger_than_payload_is_malformed() {
    let container =
      TensorContainer::try_from(vec![TensorRecord::f32("w", vec![2], vec![1.0, 2.0]).unwrap()])
        .unwrap();
    let mut bytes = encode(&container);
    // shape[0] 位于 count(4) + name_len(4) + "w"(1) + rank(4) 之后
    bytes[13..17].copy_from_slice(&3u32.to_le_bytes());
    let err = read_container(&bytes).unwrap_err();
    assert!(matches!(err, TensorError::MalformedHeader { .. }));
  }

  #[test]
  fn every_truncation_point_fails() {
    let bytes = encode(&sample_container());
    for cut in 0..bytes.len() {
      assert!(read_container(&bytes[..cut]).is_err(), "cut at {}", cut);
    }
  }

  #[test]
  fn trailing_bytes_are_rejected() {
    let mut bytes = encode(&sample_container());
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    assert!(matches!(
      read_container(&bytes).unwrap_err(),
      TensorError::MalformedHeader { .. }
    ));
  }

  #[test]
  fn repeated_name_is_malformed() {
    let mut writer = TensorWriter::new(Vec::new(), 2).unwrap();
    writer.write_f32("w", &[1], &[1.0]).unwrap();
    writer.write_f32("w", &[1], &[2.0]).unwrap();
    let bytes = writer.finish().unwrap();

    let err = read_container(&bytes).unwrap_err();
    match err {
      TensorError::MalformedHeader { field, offset, .. } => {
        assert_eq!(field, "tensor 1 name");
        // count(4) + 第一条记录 name_len(4) + "w"(1) + rank(4) + shape(4) + data(4)
        assert_eq!(offset, 21);
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[test]
  fn writer_checks_declared_count() {
    let writer = TensorWriter::new(Vec::new(), 2).unwrap();
    let err = writer.finish().unwrap_err();
    assert!(matches!(
      err,
      TensorError::CountMismatch {
        declared: 2,
        written: 0
      }
    ));

    let mut writer = TensorWriter::new(Vec::new(), 0).unwrap();
    let record = TensorRecord::f32("x", vec![1], vec![0.0]).unwrap();
    assert!(writer.write_record(&record).is_err());
  }

  #[test]
  fn file_round_trip_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.bin");
    let container = sample_container();
    write_container_file(&path, &container).unwrap();
    assert_eq!(read_container_file(&path).unwrap(), container);

    let err = read_container_file(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, TensorError::MissingFile(_)));
  }
}
