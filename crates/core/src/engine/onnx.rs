//! [`TileEngine`] on ONNX Runtime.
//!
//! The model file is read whole into memory, committed to a session through
//! [`build_session`], and validated against the configured tensor names
//! before any tile runs. The host input tensor and output buffer are
//! allocated once from the validated shape and reused for every tile.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array4, ArrayViewD, ArrayViewMutD, Ix4};
use ort::io_binding::IoBinding;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};
use serde::{Deserialize, Serialize};

use super::backend::{build_session, model_hash, resolve_trt_cache_dir, SessionConfig};
use super::{
    default_log, EngineLog, EngineShape, InferenceBackend, Severity, TensorInfo, TensorRole,
    TileEngine, DEFAULT_INPUT_TENSOR, DEFAULT_OUTPUT_TENSOR,
};
use crate::error::{LoadError, RuntimeError};

/// How tile data moves between host buffers and the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Upload the input through an `IoBinding` each tile; the output stays
    /// bound to device memory.
    #[default]
    IoBinding,
    /// Plain `Session::run` on the host input tensor.
    Direct,
}

impl TransferMode {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "run" => Self::Direct,
            _ => Self::IoBinding,
        }
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoBinding => write!(f, "iobinding"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Clone)]
pub struct EngineOptions {
    pub input_tensor: String,
    pub output_tensor: String,
    pub backend: InferenceBackend,
    pub transfer: TransferMode,
    /// Base TensorRT cache directory; a per-model subdirectory is used.
    pub trt_cache_dir: Option<PathBuf>,
    pub log: Arc<dyn EngineLog>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            input_tensor: DEFAULT_INPUT_TENSOR.to_string(),
            output_tensor: DEFAULT_OUTPUT_TENSOR.to_string(),
            backend: InferenceBackend::default(),
            transfer: TransferMode::default(),
            trt_cache_dir: None,
            log: default_log(),
        }
    }
}

pub struct OrtEngine {
    session: Session,
    binding: Option<IoBinding>,
    input_name: String,
    output_name: String,
    shape: EngineShape,
    tensors: Vec<TensorInfo>,
    input: Tensor<f32>,
    output: Array4<f32>,
    log: Arc<dyn EngineLog>,
}

impl OrtEngine {
    pub fn load(model_path: &Path, options: EngineOptions) -> Result<Self, LoadError> {
        let EngineOptions {
            input_tensor,
            output_tensor,
            backend,
            transfer,
            trt_cache_dir,
            log,
        } = options;

        let model = fs::read(model_path).map_err(|source| LoadError::Unreadable {
            path: model_path.to_path_buf(),
            source,
        })?;

        let hash = model_hash(&model);
        let trt_cache_dir = trt_cache_dir.map(|base| resolve_trt_cache_dir(&base, Some(&hash)));

        let session = build_session(&SessionConfig {
            model: &model,
            model_path,
            backend,
            trt_cache_dir: trt_cache_dir.as_deref(),
        })
        .map_err(|e| {
            let reason = format!("{e:#}");
            log.log(Severity::Error, &reason);
            LoadError::Deserialize {
                path: model_path.to_path_buf(),
                reason,
            }
        })?;

        let tensors = describe_tensors(&session);
        let shape = EngineShape::from_tensors(&tensors, &input_tensor, &output_tensor)?;

        let input = Tensor::from_array(Array4::<f32>::zeros(shape.input_dims()))
            .map_err(|e| LoadError::Context(format!("input tensor: {e}")))?;

        let binding = match transfer {
            TransferMode::IoBinding => Some(
                create_binding(&session, &output_tensor)
                    .map_err(|e| LoadError::Context(e.to_string()))?,
            ),
            TransferMode::Direct => None,
        };

        log.log(
            Severity::Info,
            &format!(
                "loaded {} [{}] model {hash}: {shape} via {backend}/{transfer}",
                model_path.display(),
                input_tensor,
            ),
        );

        Ok(Self {
            session,
            binding,
            input_name: input_tensor,
            output_name: output_tensor,
            shape,
            tensors,
            input,
            output: Array4::zeros(shape.output_dims()),
            log,
        })
    }

    /// Every input and output the model declares.
    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    fn stage_input(&mut self, tile: &Array4<f32>) -> Result<(), RuntimeError> {
        let staged = self
            .input
            .try_extract_array_mut::<f32>()
            .map_err(|e| RuntimeError::Upload(e.to_string()))?;
        stage_tile(staged, tile)
    }

    fn run_bound(&mut self, tile: &Array4<f32>) -> Result<(), RuntimeError> {
        self.stage_input(tile)?;

        let Some(binding) = self.binding.as_mut() else {
            return Err(RuntimeError::Upload("IoBinding was not created".to_string()));
        };
        // bind_input copies at call time, so the staged tensor is rebound per tile.
        binding
            .bind_input(self.input_name.as_str(), &self.input)
            .map_err(|e| RuntimeError::Upload(e.to_string()))?;
        binding
            .synchronize_inputs()
            .map_err(|e| RuntimeError::Synchronize(e.to_string()))?;

        let outputs = self
            .session
            .run_binding(binding)
            .map_err(|e| RuntimeError::Execute(e.to_string()))?;
        binding
            .synchronize_outputs()
            .map_err(|e| RuntimeError::Synchronize(e.to_string()))?;

        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| RuntimeError::Download(e.to_string()))?;
        store_output(view, &mut self.output)
    }

    fn run_direct(&mut self, tile: &Array4<f32>) -> Result<(), RuntimeError> {
        self.stage_input(tile)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &self.input])
            .map_err(|e| RuntimeError::Execute(e.to_string()))?;
        let view = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| RuntimeError::Download(e.to_string()))?;
        store_output(view, &mut self.output)
    }
}

impl TileEngine for OrtEngine {
    fn shape(&self) -> EngineShape {
        self.shape
    }

    fn run_tile(&mut self, tile: &Array4<f32>) -> Result<&Array4<f32>, RuntimeError> {
        let result = if self.binding.is_some() {
            self.run_bound(tile)
        } else {
            self.run_direct(tile)
        };
        if let Err(err) = &result {
            self.log.log(Severity::Error, &err.to_string());
        }
        result.map(|()| &self.output)
    }
}

fn create_binding(session: &Session, output_name: &str) -> ort::Result<IoBinding> {
    let mut binding = session.create_binding()?;
    binding.bind_output_to_device(output_name, &session.allocator().memory_info())?;
    Ok(binding)
}

/// Copy `tile` into the persistent input tensor's host memory.
fn stage_tile(mut dst: ArrayViewMutD<'_, f32>, tile: &Array4<f32>) -> Result<(), RuntimeError> {
    if dst.shape() != tile.shape() {
        return Err(RuntimeError::Upload(format!(
            "tile shape {:?} does not match input tensor {:?}",
            tile.shape(),
            dst.shape()
        )));
    }
    dst.assign(&tile.view().into_dyn());
    Ok(())
}

/// Copy a returned tensor into the reused host buffer after checking its shape.
fn store_output(view: ArrayViewD<'_, f32>, dst: &mut Array4<f32>) -> Result<(), RuntimeError> {
    let expected: [usize; 4] = [dst.shape()[0], dst.shape()[1], dst.shape()[2], dst.shape()[3]];
    if view.shape() != expected {
        return Err(RuntimeError::OutputShape {
            expected,
            actual: view.shape().to_vec(),
        });
    }
    let view = view
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::Download(e.to_string()))?;
    dst.assign(&view);
    Ok(())
}

fn describe_tensors(session: &Session) -> Vec<TensorInfo> {
    let inputs = session
        .inputs()
        .iter()
        .map(|outlet| tensor_info(outlet.name(), outlet.dtype(), TensorRole::Input));
    let outputs = session
        .outputs()
        .iter()
        .map(|outlet| tensor_info(outlet.name(), outlet.dtype(), TensorRole::Output));
    inputs.chain(outputs).collect()
}

fn tensor_info(name: &str, dtype: &ValueType, role: TensorRole) -> TensorInfo {
    let (data_type, shape) = match dtype {
        ValueType::Tensor { ty, shape, .. } => {
            (element_type_name(*ty), shape.iter().copied().collect())
        }
        _ => ("non-tensor".to_string(), Vec::new()),
    };
    TensorInfo {
        name: name.to_string(),
        role,
        data_type,
        shape,
    }
}

fn element_type_name(ty: TensorElementType) -> String {
    match ty {
        TensorElementType::Float32 => "float32".into(),
        TensorElementType::Float16 => "float16".into(),
        TensorElementType::Float64 => "float64".into(),
        TensorElementType::Bfloat16 => "bfloat16".into(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_mode_parse_and_display() {
        assert_eq!(TransferMode::from_str_lossy("Direct"), TransferMode::Direct);
        assert_eq!(TransferMode::from_str_lossy("iobinding"), TransferMode::IoBinding);
        assert_eq!(TransferMode::from_str_lossy("???"), TransferMode::IoBinding);
        assert_eq!(TransferMode::Direct.to_string(), "direct");
        assert_eq!(
            serde_json::to_string(&TransferMode::IoBinding).expect("serialize"),
            "\"iobinding\""
        );
    }

    #[test]
    fn test_element_type_names() {
        assert_eq!(element_type_name(TensorElementType::Float32), "float32");
        assert_eq!(element_type_name(TensorElementType::Float16), "float16");
        assert_eq!(element_type_name(TensorElementType::Int64), "int64");
    }

    #[test]
    fn test_store_output_rejects_wrong_shape() {
        let mut dst = Array4::<f32>::zeros((1, 3, 4, 4));
        let wrong = ndarray::ArrayD::<f32>::zeros(vec![1, 3, 4, 2]);
        let err = store_output(wrong.view(), &mut dst).unwrap_err();
        assert!(matches!(err, RuntimeError::OutputShape { .. }));

        let right = ndarray::ArrayD::<f32>::from_elem(vec![1, 3, 4, 4], 0.5);
        store_output(right.view(), &mut dst).expect("matching shape");
        assert!(dst.iter().all(|&v| v == 0.5));
    }

    #[test]
    fn test_stage_tile_overwrites_previous_tile() {
        let mut host = ndarray::ArrayD::<f32>::zeros(vec![1, 3, 2, 2]);
        let first = Array4::<f32>::from_elem((1, 3, 2, 2), 0.25);
        let second = Array4::<f32>::from_shape_fn((1, 3, 2, 2), |(_, c, y, x)| {
            (c * 4 + y * 2 + x) as f32
        });

        stage_tile(host.view_mut(), &first).expect("stage first");
        assert!(host.iter().all(|&v| v == 0.25));
        stage_tile(host.view_mut(), &second).expect("stage second");
        assert_eq!(host.view(), second.view().into_dyn());
    }

    #[test]
    fn test_stage_tile_rejects_wrong_shape() {
        let mut host = ndarray::ArrayD::<f32>::zeros(vec![1, 3, 2, 2]);
        let tile = Array4::<f32>::zeros((1, 3, 4, 4));
        let err = stage_tile(host.view_mut(), &tile).unwrap_err();
        assert!(matches!(err, RuntimeError::Upload(_)));
    }

    #[test]
    fn test_load_missing_file_is_unreadable() {
        let err = OrtEngine::load(Path::new("/nonexistent/model.onnx"), EngineOptions::default())
            .err()
            .expect("missing file must fail");
        assert!(matches!(err, LoadError::Unreadable { .. }));
        assert!(err.to_string().contains("/nonexistent/model.onnx"));
    }

    #[test]
    #[ignore] // Requires ONNX Runtime + model file.
    fn test_load_real_model() {
        let path = std::env::var("TILEFUSE_TEST_MODEL").expect("TILEFUSE_TEST_MODEL");
        let options = EngineOptions {
            backend: InferenceBackend::Cpu,
            ..EngineOptions::default()
        };
        let mut engine = OrtEngine::load(Path::new(&path), options).expect("load model");
        let shape = engine.shape();
        let dark = Array4::<f32>::zeros(shape.input_dims());
        let bright = Array4::<f32>::ones(shape.input_dims());

        let first = engine.run_tile(&dark).expect("run dark tile").clone();
        assert_eq!(first.shape(), &shape.output_dims());
        let second = engine.run_tile(&bright).expect("run bright tile");
        assert_ne!(&first, second, "second tile reused stale input");
    }
}
