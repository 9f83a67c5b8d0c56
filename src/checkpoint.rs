// 该文件是 Qiaojie （桥接） 项目的一部分。
// src/checkpoint.rs - 检查点形态识别与参数映射提取
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
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  tensor::{ElementKind, TensorContainer, TensorData, TensorError, TensorRecord},
  utils::ensure_exists,
};

/// 参数名到张量的映射，按名称排序
pub type StateDict = BTreeMap<String, TensorRecord>;

const MODULE_TAG: &str = "__module__";
const PARAMETER_SUFFIXES: [&str; 4] = [".weight", ".bias", ".running_mean", ".running_var"];
const SUFFIX_MIN_HITS: usize = 3;

#[derive(Error, Debug)]
pub enum CheckpointError {
  #[error("检查点中找不到参数映射, 已尝试: {}", .attempted.join("; "))]
  NoStateFound { attempted: Vec<String> },
  #[error("{location} 是模块对象 {class_name}, 只有在信任来源时才会展开 (--trust-modules)")]
  UntrustedModule { class_name: String, location: String },
  #[error("检查点文档无效: {0}")]
  InvalidDocument(String),
  #[error("张量 {name} 无效: {source}")]
  InvalidTensor { name: String, source: TensorError },
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("张量容器错误: {0}")]
  TensorError(#[from] TensorError),
  #[error("文件不存在: {}", .0.display())]
  MissingFile(PathBuf),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无法从 {0} 得到本地文件路径")]
  InvalidPath(String),
}

/// 是否允许展开检查点里的模块对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrustPolicy {
  #[default]
  WeightsOnly,
  TrustModules,
}

/// 完整模型对象，只有在信任来源时才读取其状态
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleObject {
  pub class_name: String,
  pub state: StateDict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointValue {
  Tensor(TensorRecord),
  Mapping(BTreeMap<String, CheckpointValue>),
  Module(ModuleObject),
  Opaque(Value),
}

/// 已识别的检查点形态
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
  /// 已知就是参数映射（例如已有的二进制权重文件）
  StateDict(StateDict),
  /// 顶层映射，可能是参数映射本身，也可能在某个字段里包着参数映射
  Container(BTreeMap<String, CheckpointValue>),
  /// 完整模型对象
  Module(ModuleObject),
}

/// 参数映射的提取策略，按 `RESOLUTION_ORDER` 依次尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  StateDictField,
  ModelField,
  EmaField,
  SuffixHeuristic,
  ModuleState,
}

pub const RESOLUTION_ORDER: [Strategy; 5] = [
  Strategy::StateDictField,
  Strategy::ModelField,
  Strategy::EmaField,
  Strategy::SuffixHeuristic,
  Strategy::ModuleState,
];

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::StateDictField => "字段 \"state_dict\"",
      Strategy::ModelField => "字段 \"model\"",
      Strategy::EmaField => "字段 \"ema\"",
      Strategy::SuffixHeuristic => "参数名后缀启发式",
      Strategy::ModuleState => "模块对象自身状态",
    };
    write!(f, "{}", name)
  }
}

/// 策略命中的位置，确认之后才把张量从检查点中移出
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
  Field(&'static str),
  WholeMapping,
  TopModule,
}

fn has_tensors(mapping: &BTreeMap<String, CheckpointValue>) -> bool {
  mapping
    .values()
    .any(|value| matches!(value, CheckpointValue::Tensor(_)))
}

fn tensors_of(mapping: BTreeMap<String, CheckpointValue>) -> StateDict {
  mapping
    .into_iter()
    .filter_map(|(name, value)| match value {
      CheckpointValue::Tensor(record) => Some((name, record)),
      _ => {
        debug!("跳过非张量条目: {}", name);
        None
      }
    })
    .collect()
}

fn check_trust(
  module: &ModuleObject,
  location: &str,
  policy: TrustPolicy,
) -> Result<(), CheckpointError> {
  match policy {
    TrustPolicy::TrustModules => {
      info!("展开模块对象 {} ({})", module.class_name, location);
      Ok(())
    }
    TrustPolicy::WeightsOnly => Err(CheckpointError::UntrustedModule {
      class_name: module.class_name.clone(),
      location: location.to_string(),
    }),
  }
}

impl Strategy {
  fn field(self) -> Option<&'static str> {
    match self {
      Strategy::StateDictField => Some("state_dict"),
      Strategy::ModelField => Some("model"),
      Strategy::EmaField => Some("ema"),
      Strategy::SuffixHeuristic | Strategy::ModuleState => None,
    }
  }

  /// `Ok(None)` 表示该策略不适用，继续尝试下一个
  fn try_resolve(
    self,
    checkpoint: &Checkpoint,
    policy: TrustPolicy,
  ) -> Result<Option<Selection>, CheckpointError> {
    let mapping = match (self, checkpoint) {
      (Strategy::ModuleState, Checkpoint::Module(module)) => {
        check_trust(module, "检查点顶层", policy)?;
        return Ok(Some(Selection::TopModule));
      }
      (_, Checkpoint::Container(mapping)) => mapping,
      _ => return Ok(None),
    };

    if let Some(field) = self.field() {
      let found = match mapping.get(field) {
        Some(CheckpointValue::Mapping(inner)) => has_tensors(inner),
        Some(CheckpointValue::Module(module)) if self != Strategy::StateDictField => {
          check_trust(module, &format!("字段 \"{}\"", field), policy)?;
          !module.state.is_empty()
        }
        _ => false,
      };
      return Ok(found.then_some(Selection::Field(field)));
    }

    if self == Strategy::SuffixHeuristic {
      let hits = mapping
        .keys()
        .filter(|key| PARAMETER_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)))
        .count();
      debug!("参数名后缀命中 {}/{}", hits, mapping.len());
      if hits >= SUFFIX_MIN_HITS && hits * 2 >= mapping.len() {
        return Ok(Some(Selection::WholeMapping));
      }
    }

    Ok(None)
  }
}

impl Checkpoint {
  /// 按固定优先级提取参数映射，全部失败时返回 `NoStateFound`。
  /// 张量直接从检查点中移出，不做复制。
  pub fn resolve_state(self, policy: TrustPolicy) -> Result<StateDict, CheckpointError> {
    let checkpoint = match self {
      Checkpoint::StateDict(state) => return Ok(state),
      other => other,
    };

    let mut attempted = Vec::with_capacity(RESOLUTION_ORDER.len());
    for strategy in RESOLUTION_ORDER {
      if let Some(selection) = strategy.try_resolve(&checkpoint, policy)? {
        let state = checkpoint.take_state(selection);
        info!("通过{}找到 {} 个张量", strategy, state.len());
        return Ok(state);
      }
      attempted.push(strategy.to_string());
    }

    warn!("无法识别检查点形态");
    Err(CheckpointError::NoStateFound { attempted })
  }

  fn take_state(self, selection: Selection) -> StateDict {
    match (self, selection) {
      (Checkpoint::StateDict(state), _) => state,
      (Checkpoint::Module(module), _) => module.state,
      (Checkpoint::Container(mut mapping), Selection::Field(field)) => match mapping.remove(field) {
        Some(CheckpointValue::Mapping(inner)) => tensors_of(inner),
        Some(CheckpointValue::Module(module)) => module.state,
        _ => StateDict::new(),
      },
      (Checkpoint::Container(mapping), Selection::WholeMapping | Selection::TopModule) => {
        tensors_of(mapping)
      }
    }
  }

  pub fn from_json(document: Value) -> Result<Self, CheckpointError> {
    match parse_value("", document)? {
      CheckpointValue::Mapping(mapping) => Ok(Checkpoint::Container(mapping)),
      CheckpointValue::Module(module) => Ok(Checkpoint::Module(module)),
      CheckpointValue::Tensor(_) | CheckpointValue::Opaque(_) => Err(
        CheckpointError::InvalidDocument("顶层必须是对象".to_string()),
      ),
    }
  }

  pub fn from_json_str(text: &str) -> Result<Self, CheckpointError> {
    Self::from_json(serde_json::from_str(text)?)
  }
}

impl From<TensorContainer> for Checkpoint {
  fn from(container: TensorContainer) -> Self {
    Checkpoint::StateDict(
      container
        .into_records()
        .into_iter()
        .map(|record| (record.name().to_string(), record))
        .collect(),
    )
  }
}

#[derive(Deserialize)]
struct JsonTensor {
  shape: Vec<u32>,
  #[serde(default = "default_dtype")]
  dtype: ElementKind,
  data: Value,
}

fn default_dtype() -> ElementKind {
  ElementKind::Float32
}

fn is_tensor_object(object: &serde_json::Map<String, Value>) -> bool {
  object.contains_key("shape") && object.contains_key("data")
}

fn parse_tensor(name: &str, value: Value) -> Result<TensorRecord, CheckpointError> {
  let tensor: JsonTensor = serde_json::from_value(value)?;
  let data = match tensor.dtype {
    ElementKind::Float32 => TensorData::F32(serde_json::from_value(tensor.data)?),
    ElementKind::Uint64 => TensorData::U64(serde_json::from_value(tensor.data)?),
  };
  TensorRecord::new(name, tensor.shape, data).map_err(|source| CheckpointError::InvalidTensor {
    name: name.to_string(),
    source,
  })
}

fn parse_module(
  path: &str,
  mut object: serde_json::Map<String, Value>,
) -> Result<ModuleObject, CheckpointError> {
  let class_name = match object.remove(MODULE_TAG) {
    Some(Value::String(name)) => name,
    _ => {
      return Err(CheckpointError::InvalidDocument(format!(
        "{} 的 {} 必须是字符串",
        path, MODULE_TAG
      )));
    }
  };
  let state = match object.remove("state_dict") {
    Some(Value::Object(entries)) => {
      let mut state = StateDict::new();
      for (name, value) in entries {
        state.insert(name.clone(), parse_tensor(&name, value)?);
      }
      state
    }
    _ => {
      return Err(CheckpointError::InvalidDocument(format!(
        "模块对象 {} 缺少 state_dict",
        class_name
      )));
    }
  };
  Ok(ModuleObject { class_name, state })
}

fn parse_value(path: &str, value: Value) -> Result<CheckpointValue, CheckpointError> {
  match value {
    Value::Object(object) if object.contains_key(MODULE_TAG) => {
      Ok(CheckpointValue::Module(parse_module(path, object)?))
    }
    Value::Object(object) if is_tensor_object(&object) => Ok(CheckpointValue::Tensor(
      parse_tensor(path, Value::Object(object))?,
    )),
    Value::Object(object) => {
      let mut mapping = BTreeMap::new();
      for (key, value) in object {
        let parsed = parse_value(&key, value)?;
        mapping.insert(key, parsed);
      }
      Ok(CheckpointValue::Mapping(mapping))
    }
    other => Ok(CheckpointValue::Opaque(other)),
  }
}

/// 检查点来源：`json:///path/ckpt.json` 或 `weights:///path/weights.bin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
  Json(PathBuf),
  Weights(PathBuf),
}

const JSON_SCHEME: &str = "json";
const WEIGHTS_SCHEME: &str = "weights";

impl FromUrlWithScheme for CheckpointSource {
  const SCHEME: &'static str = JSON_SCHEME;
}

impl FromUrl for CheckpointSource {
  type Error = CheckpointError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let make: fn(PathBuf) -> Self = match url.scheme() {
      JSON_SCHEME => CheckpointSource::Json,
      WEIGHTS_SCHEME => CheckpointSource::Weights,
      other => {
        return Err(CheckpointError::SchemeMismatch(format!(
          "期望 '{}' 或 '{}', 实际 '{}'",
          JSON_SCHEME, WEIGHTS_SCHEME, other
        )));
      }
    };
    // 百分号编码的路径段在这里还原
    let path = url
      .to_file_path()
      .map_err(|_| CheckpointError::InvalidPath(url.to_string()))?;
    Ok(make(path))
  }
}

impl CheckpointSource {
  pub fn path(&self) -> &std::path::Path {
    match self {
      CheckpointSource::Json(path) | CheckpointSource::Weights(path) => path,
    }
  }

  pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
    let path = self.path();
    ensure_exists(path).map_err(|_| CheckpointError::MissingFile(path.to_path_buf()))?;
    info!("加载检查点: {}", path.display());
    match self {
      CheckpointSource::Json(_) => {
        let text = std::fs::read_to_string(path)?;
        Checkpoint::from_json_str(&text)
      }
      CheckpointSource::Weights(_) => Ok(crate::tensor::read_container_file(path)?.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn tensor_json(values: &[f32]) -> Value {
    json!({ "shape": [values.len()], "data": values })
  }

  fn raw_state() -> Value {
    json!({
      "model.0.conv.weight": tensor_json(&[1.0, 2.0]),
      "model.0.conv.bias": tensor_json(&[0.5]),
      "model.0.bn.running_mean": tensor_json(&[0.0]),
      "model.0.bn.running_var": tensor_json(&[1.0]),
      "model.0.bn.num_batches_tracked": { "shape": [], "dtype": "uint64", "data": [10] },
    })
  }

  #[test]
  fn raw_mapping_resolves_by_suffix_heuristic() {
    let checkpoint = Checkpoint::from_json(raw_state()).unwrap();
    let state = checkpoint.resolve_state(TrustPolicy::WeightsOnly).unwrap();
    assert_eq!(state.len(), 5);
    assert_eq!(
      state["model.0.bn.num_batches_tracked"].data(),
      &TensorData::U64(vec![10])
    );
  }

  #[test]
  fn state_dict_field_wins_over_model_field() {
    let document = json!({
      "state_dict": { "a.weight": tensor_json(&[1.0]) },
      "model": { "b.weight": tensor_json(&[2.0]) },
      "epoch": 3,
    });
    let state = Checkpoint::from_json(document)
      .unwrap()
      .resolve_state(TrustPolicy::WeightsOnly)
      .unwrap();
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["a.weight"]);
  }

  #[test]
  fn ema_field_used_when_model_is_opaque() {
    let document = json!({
      "model": null,
      "ema": { "c.weight": tensor_json(&[3.0]) },
    });
    let state = Checkpoint::from_json(document)
      .unwrap()
      .resolve_state(TrustPolicy::WeightsOnly)
      .unwrap();
    assert!(state.contains_key("c.weight"));
  }

  #[test]
  fn module_objects_need_trust() {
    let document = json!({
      "epoch": 10,
      "model": {
        "__module__": "models.yolo.Model",
        "state_dict": { "d.weight": tensor_json(&[4.0]) },
      },
    });
    let checkpoint = Checkpoint::from_json(document).unwrap();

    let err = checkpoint.clone().resolve_state(TrustPolicy::WeightsOnly).unwrap_err();
    assert!(matches!(
      err,
      CheckpointError::UntrustedModule { ref class_name, .. } if class_name == "models.yolo.Model"
    ));

    let state = checkpoint.resolve_state(TrustPolicy::TrustModules).unwrap();
    assert!(state.contains_key("d.weight"));
  }

  #[test]
  fn resolution_moves_tensors_out() {
    let checkpoint = Checkpoint::from_json(json!({
      "state_dict": { "a.weight": tensor_json(&[1.0, 2.0, 3.0]) },
      "epoch": 1,
    }))
    .unwrap();
    let before = match &checkpoint {
      Checkpoint::Container(mapping) => match &mapping["state_dict"] {
        CheckpointValue::Mapping(inner) => match &inner["a.weight"] {
          CheckpointValue::Tensor(record) => record.data().as_f32().unwrap().as_ptr(),
          other => panic!("unexpected value: {other:?}"),
        },
        other => panic!("unexpected value: {other:?}"),
      },
      other => panic!("unexpected checkpoint: {other:?}"),
    };

    let state = checkpoint.resolve_state(TrustPolicy::WeightsOnly).unwrap();
    assert_eq!(state["a.weight"].data().as_f32().unwrap().as_ptr(), before);
  }

  #[test]
  fn top_level_module_resolves_last() {
    let document = json!({
      "__module__": "models.yolo.DetectionModel",
      "state_dict": { "e.bias": tensor_json(&[5.0]) },
    });
    let checkpoint = Checkpoint::from_json(document).unwrap();
    assert!(matches!(checkpoint, Checkpoint::Module(_)));
    let state = checkpoint.resolve_state(TrustPolicy::TrustModules).unwrap();
    assert!(state.contains_key("e.bias"));
  }

  #[test]
  fn unrecognized_shape_lists_attempts() {
    let document = json!({
      "epoch": 1,
      "optimizer": { "lr": 0.01 },
      "one.weight": tensor_json(&[1.0]),
    });
    let err = Checkpoint::from_json(document)
      .unwrap()
      .resolve_state(TrustPolicy::TrustModules)
      .unwrap_err();
    match err {
      CheckpointError::NoStateFound { attempted } => {
        assert_eq!(attempted.len(), RESOLUTION_ORDER.len())
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn heuristic_requires_majority_of_keys() {
    let mut document = raw_state();
    let object = document.as_object_mut().unwrap();
    for i in 0..10 {
      object.insert(format!("meta_{}", i), json!(i));
    }
    let err = Checkpoint::from_json(document)
      .unwrap()
      .resolve_state(TrustPolicy::WeightsOnly)
      .unwrap_err();
    assert!(matches!(err, CheckpointError::NoStateFound { .. }));
  }

  #[test]
  fn invalid_tensor_is_reported_with_name() {
    let document = json!({ "x.weight": { "shape": [3], "data": [1.0] } });
    let err = Checkpoint::from_json(document).unwrap_err();
    assert!(matches!(err, CheckpointError::InvalidTensor { ref name, .. } if name == "x.weight"));
  }

  #[test]
  fn source_from_url() {
    let url = Url::parse("json:///tmp/ckpt.json").unwrap();
    assert_eq!(
      CheckpointSource::from_url(&url).unwrap(),
      CheckpointSource::Json(PathBuf::from("/tmp/ckpt.json"))
    );
    let url = Url::parse("weights:///tmp/weights.bin").unwrap();
    assert!(matches!(
      CheckpointSource::from_url(&url).unwrap(),
      CheckpointSource::Weights(_)
    ));
    let url = Url::parse("ftp:///tmp/x").unwrap();
    assert!(matches!(
      CheckpointSource::from_url(&url),
      Err(CheckpointError::SchemeMismatch(_))
    ));
    let url = Url::parse("json://example.com/tmp/ckpt.json").unwrap();
    assert!(matches!(
      CheckpointSource::from_url(&url),
      Err(CheckpointError::InvalidPath(_))
    ));
  }

  #[test]
  fn encoded_path_is_decoded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("my ckpt 权重.json");
    std::fs::write(&path, serde_json::to_string(&raw_state()).unwrap()).unwrap();

    let url = Url::parse(&format!("json://{}", path.display())).unwrap();
    assert!(url.path().contains("%20"));
    let source = CheckpointSource::from_url(&url).unwrap();
    assert_eq!(source.path(), path.as_path());
    let state = source.load().unwrap().resolve_state(TrustPolicy::WeightsOnly).unwrap();
    assert_eq!(state.len(), 5);
  }

  #[test]
  fn missing_checkpoint_file() {
    let source = CheckpointSource::Json(PathBuf::from("/no/such/ckpt.json"));
    assert!(matches!(source.load().unwrap_err(), CheckpointError::MissingFile(_)));
  }
}
