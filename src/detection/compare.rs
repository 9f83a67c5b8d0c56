// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/detection/compare.rs - 两组检测结果的对比
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
use std::fmt;

use super::{DetectionList, DetectionRecord, class_name};

pub const DEFAULT_TOP: usize = 5;

/// 按现有顺序逐位对比，不做 IoU 匹配
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonReport {
  pub candidate_count: usize,
  pub reference_count: usize,
  pub only_in_candidate: BTreeSet<u8>,
  pub only_in_reference: BTreeSet<u8>,
  pub rows: Vec<(Option<DetectionRecord>, Option<DetectionRecord>)>,
}

fn class_set(list: &DetectionList) -> BTreeSet<u8> {
  list.iter().map(|record| record.class_id).collect()
}

impl ComparisonReport {
  pub fn compare(candidate: &DetectionList, reference: &DetectionList, top: usize) -> Self {
    let candidate_classes = class_set(candidate);
    let reference_classes = class_set(reference);
    let shown = top.min(candidate.len().max(reference.len()));
    let rows = (0..shown)
      .map(|i| {
        (
          candidate.records.get(i).copied(),
          reference.records.get(i).copied(),
        )
      })
      .collect();

    Self {
      candidate_count: candidate.len(),
      reference_count: reference.len(),
      only_in_candidate: &candidate_classes - &reference_classes,
      only_in_reference: &reference_classes - &candidate_classes,
      rows,
    }
  }

  pub fn counts_match(&self) -> bool {
    self.candidate_count == self.reference_count
  }

  pub fn classes_match(&self) -> bool {
    self.only_in_candidate.is_empty() && self.only_in_reference.is_empty()
  }

  /// 数量与类别集合都一致
  pub fn is_consistent(&self) -> bool {
    self.counts_match() && self.classes_match()
  }

  /// 前 N 行中类别不同或一侧缺失的行数
  pub fn positional_mismatches(&self) -> usize {
    self
      .rows
      .iter()
      .filter(|(candidate, reference)| match (candidate, reference) {
        (Some(c), Some(r)) => c.class_id != r.class_id,
        _ => true,
      })
      .count()
  }
}

fn format_classes(classes: &BTreeSet<u8>) -> String {
  let names: Vec<_> = classes.iter().map(|&id| class_name(id).into_owned()).collect();
  format!("[{}]", names.join(", "))
}

fn format_cell(record: &Option<DetectionRecord>) -> String {
  match record {
    Some(r) => format!(
      "{} {:.3} ({},{})",
      r.class_name(),
      r.confidence(),
      r.center_x,
      r.center_y
    ),
    None => String::new(),
  }
}

impl fmt::Display for ComparisonReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "=== Comparison ===")?;
    writeln!(f, "Candidate detections: {}", self.candidate_count)?;
    writeln!(f, "Reference detections: {}", self.reference_count)?;
    if !self.counts_match() {
      writeln!(f, "WARNING: detection count mismatch")?;
    }
    if !self.classes_match() {
      writeln!(f, "Only in candidate: {}", format_classes(&self.only_in_candidate))?;
      writeln!(f, "Only in reference: {}", format_classes(&self.only_in_reference))?;
    }
    writeln!(f)?;
    writeln!(f, "{:<40} | {:<40}", "Candidate", "Reference")?;
    writeln!(f, "{}", "-".repeat(83))?;
    for (candidate, reference) in &self.rows {
      writeln!(f, "{:<40} | {:<40}", format_cell(candidate), format_cell(reference))?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(class_id: u8, confidence: u8) -> DetectionRecord {
    DetectionRecord {
      center_x: 10,
      center_y: 20,
      width: 4,
      height: 4,
      class_id,
      confidence,
      reserved: [0; 2],
    }
  }

  #[test]
  fn identical_lists_are_consistent() {
    let list = DetectionList::from(vec![record(0, 200), record(2, 100)]);
    let report = ComparisonReport::compare(&list, &list, DEFAULT_TOP);
    assert!(report.is_consistent());
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.positional_mismatches(), 0);
  }

  #[test]
  fn differences_are_reported() {
    let candidate = DetectionList::from(vec![record(0, 200), record(5, 100), record(0, 50)]);
    let reference = DetectionList::from(vec![record(2, 210), record(0, 190)]);
    let report = ComparisonReport::compare(&candidate, &reference, 2);

    assert!(!report.counts_match());
    assert_eq!(report.only_in_candidate, BTreeSet::from([5]));
    assert_eq!(report.only_in_reference, BTreeSet::from([2]));
    assert_eq!(report.rows.len(), 2);
    assert_eq!(report.positional_mismatches(), 2);

    let text = report.to_string();
    assert!(text.contains("WARNING: detection count mismatch"));
    assert!(text.contains("Only in candidate: [bus]"));
    assert!(text.contains("person 0.784 (10,20)"));
  }

  #[test]
  fn same_classes_in_other_order_still_consistent() {
    let candidate = DetectionList::from(vec![record(1, 90), record(3, 80)]);
    let reference = DetectionList::from(vec![record(3, 95), record(1, 85)]);
    let report = ComparisonReport::compare(&candidate, &reference, DEFAULT_TOP);
    assert!(report.is_consistent());
    assert_eq!(report.positional_mismatches(), 2);
  }
}
