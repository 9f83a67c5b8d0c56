// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/detection.rs - 检测结果二进制记录、文本报告与参考列表
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

use std::borrow::Cow;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  letterbox::PreprocessedImage,
  model::{DetectItem, Detector},
  utils::{ensure_exists, write_atomically},
};

/// `<u16 cx, u16 cy, u16 w, u16 h, u8 class, u8 conf, u8 r0, u8 r1>`
pub const RECORD_SIZE: usize = 12;
/// 计数字段只有一个字节
pub const MAX_DETECTIONS: usize = u8::MAX as usize;

#[derive(Error, Debug)]
pub enum DetectionError {
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 单个检测框，坐标为画布像素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectionRecord {
  pub center_x: u16,
  pub center_y: u16,
  pub width: u16,
  pub height: u16,
  pub class_id: u8,
  /// `round(conf * 255)`
  pub confidence: u8,
  pub reserved: [u8; 2],
}

pub fn quantize_confidence(confidence: f32) -> u8 {
  (confidence * 255.0).round().clamp(0.0, 255.0) as u8
}

impl DetectionRecord {
  pub fn confidence(&self) -> f32 {
    self.confidence as f32 / 255.0
  }

  pub fn class_name(&self) -> Cow<'static, str> {
    class_name(self.class_id)
  }

  pub fn x1(&self) -> i32 {
    self.center_x as i32 - self.width as i32 / 2
  }

  pub fn y1(&self) -> i32 {
    self.center_y as i32 - self.height as i32 / 2
  }

  pub fn x2(&self) -> i32 {
    self.center_x as i32 + self.width as i32 / 2
  }

  pub fn y2(&self) -> i32 {
    self.center_y as i32 + self.height as i32 / 2
  }

  pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
    let mut bytes = [0u8; RECORD_SIZE];
    LittleEndian::write_u16(&mut bytes[0..2], self.center_x);
    LittleEndian::write_u16(&mut bytes[2..4], self.center_y);
    LittleEndian::write_u16(&mut bytes[4..6], self.width);
    LittleEndian::write_u16(&mut bytes[6..8], self.height);
    bytes[8] = self.class_id;
    bytes[9] = self.confidence;
    bytes[10..12].copy_from_slice(&self.reserved);
    bytes
  }

  pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
    Self {
      center_x: LittleEndian::read_u16(&bytes[0..2]),
      center_y: LittleEndian::read_u16(&bytes[2..4]),
      width: LittleEndian::read_u16(&bytes[4..6]),
      height: LittleEndian::read_u16(&bytes[6..8]),
      class_id: bytes[8],
      confidence: bytes[9],
      reserved: [bytes[10], bytes[11]],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DetectionList {
  pub records: Vec<DetectionRecord>,
}

impl From<Vec<DetectionRecord>> for DetectionList {
  fn from(records: Vec<DetectionRecord>) -> Self {
    Self { records }
  }
}

impl DetectionList {
  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectionRecord> {
    self.records.iter()
  }

  /// 按置信度降序的稳定排序
  pub fn sort_by_confidence(&mut self) {
    self.records.sort_by(|a, b| b.confidence.cmp(&a.confidence));
  }

  /// 参与编码的记录，超过 255 条时只保留前 255 条
  fn encoded_records(&self) -> &[DetectionRecord] {
    let count = self.records.len().min(MAX_DETECTIONS);
    if count < self.records.len() {
      warn!(
        "检测数量 {} 超过 {}, 只保留前 {} 条",
        self.records.len(),
        MAX_DETECTIONS,
        count
      );
    }
    &self.records[..count]
  }

  pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
    let records = self.encoded_records();
    writer.write_all(&[records.len() as u8])?;
    for record in records {
      writer.write_all(&record.to_bytes())?;
    }
    Ok(())
  }

  pub fn encode(&self) -> Vec<u8> {
    let records = self.encoded_records();
    let mut bytes = Vec::with_capacity(1 + records.len() * RECORD_SIZE);
    bytes.push(records.len() as u8);
    for record in records {
      bytes.extend_from_slice(&record.to_bytes());
    }
    bytes
  }

  /// 空输入得到空列表；记录不完整时返回已读出的部分
  pub fn decode(bytes: &[u8]) -> Self {
    let Some((&count, body)) = bytes.split_first() else {
      debug!("检测结果为空");
      return Self::default();
    };

    let records: Vec<_> = body
      .chunks_exact(RECORD_SIZE)
      .take(count as usize)
      .filter_map(|chunk| <&[u8; RECORD_SIZE]>::try_from(chunk).ok())
      .map(DetectionRecord::from_bytes)
      .collect();
    if records.len() < count as usize {
      warn!(
        "检测结果被截断: 声明 {} 条, 实际读出 {} 条",
        count,
        records.len()
      );
    }
    Self { records }
  }

  pub fn write_report<W: Write>(&self, writer: &mut W, title: &str) -> std::io::Result<()> {
    writeln!(writer, "# {}", title)?;
    writeln!(writer, "# Detections: {}", self.records.len())?;
    writeln!(writer, "# Format: class_id class_name confidence x y w h")?;
    writeln!(writer)?;
    for record in &self.records {
      writeln!(
        writer,
        "{} {:<15} {:.4} {:>4} {:>4} {:>4} {:>4}",
        record.class_id,
        record.class_name(),
        record.confidence(),
        record.center_x,
        record.center_y,
        record.width,
        record.height
      )?;
    }
    Ok(())
  }
}

impl<'a> IntoIterator for &'a DetectionList {
  type Item = &'a DetectionRecord;
  type IntoIter = std::slice::Iter<'a, DetectionRecord>;

  fn into_iter(self) -> Self::IntoIter {
    self.records.iter()
  }
}

pub fn read_detections(path: &Path) -> Result<DetectionList, DetectionError> {
  ensure_exists(path).map_err(|e| DetectionError::MissingFile(e.0))?;
  let list = DetectionList::decode(&std::fs::read(path)?);
  debug!("从 {} 读取 {} 条检测", path.display(), list.len());
  Ok(list)
}

pub fn write_detections(path: &Path, list: &DetectionList) -> Result<(), DetectionError> {
  write_atomically(path, |file| list.write_to(file).map_err(DetectionError::from))
}

pub fn write_report_file(
  path: &Path,
  list: &DetectionList,
  title: &str,
) -> Result<(), DetectionError> {
  write_atomically(path, |file| {
    list.write_report(file, title).map_err(DetectionError::from)
  })
}

fn saturating_u16(value: f32) -> u16 {
  // 浮点转整数向零截断并饱和, NaN 为 0
  value as u16
}

impl From<&DetectItem> for DetectionRecord {
  fn from(item: &DetectItem) -> Self {
    let [center_x, center_y, width, height] = item.bbox;
    let class_id = u8::try_from(item.class_id).unwrap_or_else(|_| {
      warn!("类别 {} 超出 u8 范围", item.class_id);
      u8::MAX
    });
    Self {
      center_x: saturating_u16(center_x),
      center_y: saturating_u16(center_y),
      width: saturating_u16(width),
      height: saturating_u16(height),
      class_id,
      confidence: quantize_confidence(item.score),
      reserved: [0; 2],
    }
  }
}

/// 运行检测器并生成按置信度降序排列的检测列表
pub fn reference_list<D: Detector>(
  detector: &mut D,
  image: &PreprocessedImage,
) -> Result<DetectionList, D::Error> {
  let mut items = detector.detect(image)?;
  items.sort_by(|a, b| b.score.total_cmp(&a.score));
  Ok(DetectionList {
    records: items.iter().map(DetectionRecord::from).collect(),
  })
}

mod labels;
pub use self::labels::{COCO_CLASSES, class_name};

pub mod compare;
