// 该文件是 Qiaojie （桥接） 项目的一部分。
// tests/layer_capture.rs - 按 YOLOv5n 拓扑采集逐层输出
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

use image::{Rgb, RgbImage};
use qiaojie::{
  capture::{Activation, CaptureError, LayerTopology, capture},
  letterbox::preprocess,
  model::{LayerKind, LayeredModel, ReplayModel},
  tensor::read_container_file,
};

const CHANNELS: [u32; 24] = [
  16, 32, 32, 64, 64, 128, 128, 256, 256, 256, 128, 128, 256, 128, 64, 64, 128, 64, 64, 128, 128,
  128, 256, 256,
];
const STRIDES: [u32; 24] = [
  2, 4, 4, 8, 8, 16, 16, 32, 32, 32, 32, 16, 16, 16, 16, 8, 8, 8, 16, 16, 16, 32, 32, 32,
];
const MERGES: [usize; 4] = [12, 16, 19, 22];

#[derive(Debug, thiserror::Error)]
#[error("invalid activation")]
struct Invalid;

/// 只产生形状正确、数值确定的输出
struct ShapeOnly {
  input_size: u32,
}

impl LayeredModel for ShapeOnly {
  type Error = Invalid;

  fn layer_count(&self) -> usize {
    CHANNELS.len()
  }

  fn layer_kind(&self, index: usize) -> LayerKind {
    if MERGES.contains(&index) {
      LayerKind::Concat
    } else {
      LayerKind::Compute
    }
  }

  fn forward_layer(&mut self, index: usize, input: &Activation) -> Result<Activation, Invalid> {
    let side = self.input_size / STRIDES[index];
    let channels = CHANNELS[index];
    let seed = input.data().iter().take(16).sum::<f32>();
    let data = (0..channels * side * side)
      .map(|i| seed * 0.001 + index as f32 + (i % 97) as f32 / 97.0)
      .collect();
    Activation::new([1, channels, side, side], data).map_err(|_| Invalid)
  }
}

fn yolov5n_topology() -> LayerTopology {
  let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/yolov5n_topology.json");
  LayerTopology::load(&path).unwrap()
}

fn network_input(size: u32) -> Activation {
  let image = RgbImage::from_fn(96, 54, |x, y| Rgb([x as u8, y as u8, 128]));
  let preprocessed = preprocess(&image, size).unwrap();
  Activation::from(&preprocessed.pixels)
}

#[test]
fn yolov5n_channel_table() {
  let mut model = ShapeOnly { input_size: 64 };
  let captured = capture(&mut model, &yolov5n_topology(), network_input(64)).unwrap();

  assert_eq!(captured.outputs.len(), 24);
  let channels: Vec<u32> = captured.outputs.iter().map(|a| a.channels()).collect();
  assert_eq!(channels, CHANNELS);
  for (index, output) in captured.outputs.iter().enumerate() {
    let side = 64 / STRIDES[index];
    assert_eq!(output.shape(), [1, CHANNELS[index], side, side], "layer {index}");
  }

  // layer 12 = cat(layer 11, layer 6)
  let merged = &captured.outputs[12];
  let first = captured.outputs[11].data().len();
  assert_eq!(&merged.data()[..first], captured.outputs[11].data());
  assert_eq!(&merged.data()[first..], captured.outputs[6].data());
}

#[test]
fn replayed_dump_matches_capture() {
  let dir = tempfile::tempdir().unwrap();
  let dump = dir.path().join("layers.bin");
  let topology = yolov5n_topology();

  let mut model = ShapeOnly { input_size: 32 };
  let captured = capture(&mut model, &topology, network_input(32)).unwrap();
  captured.write_container_file(&dump).unwrap();

  let recorded = read_container_file(&dump).unwrap();
  let mut replay = ReplayModel::new(&recorded, topology.merge_layers()).unwrap();
  let input = replay.input().clone();
  let replayed = capture(&mut replay, &topology, input).unwrap();
  assert_eq!(replayed, captured);
}

#[test]
fn wrong_topology_fails_replay() {
  let topology = yolov5n_topology();
  let mut model = ShapeOnly { input_size: 32 };
  let captured = capture(&mut model, &topology, network_input(32)).unwrap();
  let recorded = captured.into_container().unwrap();

  let swapped = LayerTopology::from_json_str(
    r#"{"merges": {"12": [6, 11], "16": [15, 4], "19": [18, 14], "22": [21, 10]}}"#,
  )
  .unwrap();
  let mut replay = ReplayModel::new(&recorded, swapped.merge_layers()).unwrap();
  let input = replay.input().clone();
  let err = capture(&mut replay, &swapped, input).unwrap_err();
  assert!(matches!(err, CaptureError::Forward { layer: 13, .. }));
}

#[test]
fn missing_merge_entry_is_fatal() {
  let partial =
    LayerTopology::from_json_str(r#"{"merges": {"12": [11, 6], "16": [15, 4]}}"#).unwrap();
  let mut model = ShapeOnly { input_size: 32 };
  let err = capture(&mut model, &partial, network_input(32)).unwrap_err();
  assert!(matches!(err, CaptureError::UnknownTopology { layer: 19 }));
}
