use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ort::{DynValue, GraphOptimizationLevel, Session, Tensor, TensorElementType, ValueType};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::inference::slot::ModelSession;

/// Host platforms an ONNX Runtime library is shipped for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    WindowsX86_64,
    MacOsAarch64,
    LinuxAarch64,
    LinuxX86_64,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "Unable to determine a path to the onnxruntime shared library for OS \"{os}\" and architecture \"{arch}\""
)]
pub struct UnsupportedPlatform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    /// Resolves values as reported by `std::env::consts::{OS, ARCH}`.
    pub fn resolve(os: &str, arch: &str) -> Result<Self, UnsupportedPlatform> {
        match (os, arch) {
            ("windows", "x86_64") => Ok(Platform::WindowsX86_64),
            ("macos", "aarch64") => Ok(Platform::MacOsAarch64),
            ("linux", "aarch64") => Ok(Platform::LinuxAarch64),
            ("linux", "x86_64") => Ok(Platform::LinuxX86_64),
            _ => Err(UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            }),
        }
    }

    pub fn host() -> Result<Self, UnsupportedPlatform> {
        Self::resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn library_file(&self) -> &'static str {
        match self {
            Platform::WindowsX86_64 => "onnxruntime.dll",
            Platform::MacOsAarch64 => "onnxruntime_arm64.dylib",
            Platform::LinuxAarch64 => "onnxruntime_arm64.so",
            Platform::LinuxX86_64 => "onnxruntime.so",
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::WindowsX86_64 => write!(f, "windows/x86_64"),
            Platform::MacOsAarch64 => write!(f, "macos/aarch64"),
            Platform::LinuxAarch64 => write!(f, "linux/aarch64"),
            Platform::LinuxX86_64 => write!(f, "linux/x86_64"),
        }
    }
}

pub fn shared_library_path(library_dir: &Path, platform: Platform) -> PathBuf {
    library_dir.join(platform.library_file())
}

/// Guard for the process-wide ONNX Runtime environment. Dropping it marks the
/// end of the runtime's use; it must outlive every [`OnnxSession`].
pub struct OnnxEnvironment {
    library_path: PathBuf,
}

impl OnnxEnvironment {
    #[tracing::instrument(level = "info")]
    pub fn initialize(library_path: &Path) -> Result<Self> {
        // ort panics on a missing dylib, check it up front
        if !library_path.is_file() {
            bail!(
                "ONNX Runtime shared library not found at {}",
                library_path.display()
            );
        }

        ort::init_from(library_path.to_string_lossy())
            .with_name(env!("CARGO_PKG_NAME"))
            .commit()
            .context("Failed to initialize ONNX Runtime environment")?;
        info!("Initialized ONNX Runtime from {}", library_path.display());

        Ok(Self {
            library_path: library_path.to_path_buf(),
        })
    }
}

impl Drop for OnnxEnvironment {
    fn drop(&mut self) {
        info!(
            "Released ONNX Runtime environment from {}",
            self.library_path.display()
        );
    }
}

/// Name and element count of one model tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub arity: usize,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
        }
    }
}

/// A loaded model plus the tensors it reads features from and writes labels
/// into. Both are allocated once at load and reused by every run.
pub struct OnnxSession {
    // Allocated from the session, so they are declared first to drop first.
    // Held type-erased as only `DynValue` is `Send`
    features: DynValue,
    labels: Option<DynValue>,
    label_shape: Vec<i64>,
    session: Session,
    input: TensorSpec,
    output: TensorSpec,
}

impl OnnxSession {
    /// Loads `model_file` and checks that it declares `input` as a float tensor
    /// and `output` as an int64 tensor of compatible shapes.
    #[tracing::instrument(level = "info", skip(_environment))]
    pub fn load(
        _environment: &OnnxEnvironment,
        model_file: &Path,
        input: TensorSpec,
        output: TensorSpec,
    ) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)?
            .with_intra_threads(1)?
            .commit_from_file(model_file)
            .with_context(|| {
                format!("Failed to create session for {}", model_file.display())
            })?;

        let declared_input = session
            .inputs
            .iter()
            .find(|declared| declared.name == input.name)
            .with_context(|| format!("Model declares no input named {}", input.name))?;
        check_tensor(&input, &declared_input.input_type, TensorElementType::Float32)?;

        let declared_output = session
            .outputs
            .iter()
            .find(|declared| declared.name == output.name)
            .with_context(|| format!("Model declares no output named {}", output.name))?;
        check_tensor(&output, &declared_output.output_type, TensorElementType::Int64)?;

        let feature_shape = bound_shape(&input, &declared_input.input_type)?;
        let label_shape = bound_shape(&output, &declared_output.output_type)?;
        let features = Tensor::<f32>::new(session.allocator(), feature_shape.clone())?.into_dyn();
        let labels = Tensor::<i64>::new(session.allocator(), label_shape.clone())?.into_dyn();
        debug!(
            "Allocated {} {:?} and {} {:?}",
            input.name, feature_shape, output.name, label_shape
        );

        info!(
            "Loaded model {} ({}[{}] -> {}[{}])",
            model_file.display(),
            input.name,
            input.arity,
            output.name,
            output.arity
        );
        Ok(Self {
            features,
            labels: Some(labels),
            label_shape,
            session,
            input,
            output,
        })
    }
}

/// Shape of the single-sample tensor bound for `spec`: dynamic dimensions
/// become 1 and the last one carries the arity.
fn bound_shape(spec: &TensorSpec, declared: &ValueType) -> Result<Vec<i64>> {
    let dimensions = match declared {
        ValueType::Tensor { dimensions, .. } if !dimensions.is_empty() => dimensions,
        _ => return Ok(vec![spec.arity as i64]),
    };
    let last = dimensions.len() - 1;
    let shape: Vec<i64> = dimensions
        .iter()
        .enumerate()
        .map(|(i, &dim)| match dim {
            _ if i == last => spec.arity as i64,
            dim if dim < 0 => 1,
            dim => dim,
        })
        .collect();

    let elements: i64 = shape.iter().product();
    if elements != spec.arity as i64 {
        bail!(
            "Model tensor {} has shape {:?}, which does not hold {} values",
            spec.name,
            dimensions,
            spec.arity
        );
    }
    Ok(shape)
}

/// The last dimension must match the arity unless the model leaves it dynamic.
fn check_tensor(
    spec: &TensorSpec,
    declared: &ValueType,
    element: TensorElementType,
) -> Result<()> {
    let ValueType::Tensor { ty, dimensions, .. } = declared else {
        bail!("Model value {} is not a tensor", spec.name);
    };
    if *ty != element {
        bail!(
            "Model tensor {} has element type {:?}, expected {:?}",
            spec.name,
            ty,
            element
        );
    }
    match dimensions.last() {
        Some(&dim) if dim >= 0 && dim as usize != spec.arity => bail!(
            "Model tensor {} has last dimension {}, expected {}",
            spec.name,
            dim,
            spec.arity
        ),
        Some(&dim) if dim < 0 => {
            debug!("Model tensor {} has a dynamic last dimension", spec.name)
        }
        None => warn!("Model tensor {} declares no dimensions", spec.name),
        _ => {}
    }
    Ok(())
}

impl ModelSession for OnnxSession {
    fn input_arity(&self) -> usize {
        self.input.arity
    }

    fn output_arity(&self) -> usize {
        self.output.arity
    }

    fn run(&mut self, input: &[f32], output: &mut [i64]) -> Result<()> {
        let (_, features) = self.features.try_extract_raw_tensor_mut::<f32>()?;
        if features.len() != input.len() {
            bail!(
                "Model takes {} features, got {}",
                features.len(),
                input.len()
            );
        }
        features.copy_from_slice(input);

        // A failed run drops the bound label tensor, allocate a fresh one then
        let labels = match self.labels.take() {
            Some(labels) => labels,
            None => Tensor::<i64>::new(self.session.allocator(), self.label_shape.clone())?
                .into_dyn(),
        };

        let mut binding = self.session.create_binding()?;
        binding.bind_input(&self.input.name, &self.features)?;
        binding.bind_output(&self.output.name, labels)?;
        let mut outputs = binding.run()?;

        // The engine wrote into the bound tensor, take it back for the next run
        let labels = outputs
            .remove(self.output.name.as_str())
            .with_context(|| format!("Model produced no output named {}", self.output.name))?;
        let copied = copy_labels(&labels, output);
        self.labels = Some(labels);
        copied
    }
}

fn copy_labels(labels: &DynValue, output: &mut [i64]) -> Result<()> {
    let (_, values) = labels.try_extract_raw_tensor::<i64>()?;
    if values.len() != output.len() {
        bail!(
            "Model produced {} labels, expected {}",
            values.len(),
            output.len()
        );
    }
    output.copy_from_slice(values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_the_four_supported_platforms() {
        let dir = Path::new("./third_party");
        let cases = [
            ("windows", "x86_64", "./third_party/onnxruntime.dll"),
            ("macos", "aarch64", "./third_party/onnxruntime_arm64.dylib"),
            ("linux", "aarch64", "./third_party/onnxruntime_arm64.so"),
            ("linux", "x86_64", "./third_party/onnxruntime.so"),
        ];
        for (os, arch, expected) in cases {
            let platform = Platform::resolve(os, arch).unwrap();
            assert_eq!(shared_library_path(dir, platform), PathBuf::from(expected));
        }
    }

    #[test]
    fn unsupported_platform_is_explicit() {
        let err = Platform::resolve("macos", "x86_64").unwrap_err();
        assert_eq!(
            err,
            UnsupportedPlatform {
                os: "macos".into(),
                arch: "x86_64".into()
            }
        );
        assert!(err.to_string().contains("macos"));
        assert!(Platform::resolve("freebsd", "x86_64").is_err());
        assert!(Platform::resolve("linux", "riscv64").is_err());
    }

    #[test]
    fn missing_library_fails_before_loading() {
        let result = OnnxEnvironment::initialize(Path::new("./does/not/exist/onnxruntime.so"));
        assert!(result.is_err());
    }

    #[test]
    fn tensor_shape_is_checked() {
        let spec = TensorSpec::new("X", 4);
        let fixed = ValueType::Tensor {
            ty: TensorElementType::Float32,
            dimensions: vec![-1, 4],
        };
        assert!(check_tensor(&spec, &fixed, TensorElementType::Float32).is_ok());
        assert!(check_tensor(&spec, &fixed, TensorElementType::Int64).is_err());

        let wrong = ValueType::Tensor {
            ty: TensorElementType::Float32,
            dimensions: vec![1, 3],
        };
        assert!(check_tensor(&spec, &wrong, TensorElementType::Float32).is_err());

        let dynamic = ValueType::Tensor {
            ty: TensorElementType::Int64,
            dimensions: vec![-1],
        };
        let label = TensorSpec::new("output_label", 1);
        assert!(check_tensor(&label, &dynamic, TensorElementType::Int64).is_ok());
    }

    #[test]
    fn bound_shapes_hold_one_sample() {
        let features = TensorSpec::new("X", 4);
        let batched = ValueType::Tensor {
            ty: TensorElementType::Float32,
            dimensions: vec![-1, 4],
        };
        assert_eq!(bound_shape(&features, &batched).unwrap(), vec![1, 4]);

        let open = ValueType::Tensor {
            ty: TensorElementType::Float32,
            dimensions: vec![-1, -1],
        };
        assert_eq!(bound_shape(&features, &open).unwrap(), vec![1, 4]);

        let label = TensorSpec::new("output_label", 1);
        let labels = ValueType::Tensor {
            ty: TensorElementType::Int64,
            dimensions: vec![-1],
        };
        assert_eq!(bound_shape(&label, &labels).unwrap(), vec![1]);

        let undeclared = ValueType::Tensor {
            ty: TensorElementType::Int64,
            dimensions: vec![],
        };
        assert_eq!(bound_shape(&label, &undeclared).unwrap(), vec![1]);
    }

    #[test]
    fn bound_shape_rejects_fixed_batches() {
        let features = TensorSpec::new("X", 4);
        let fixed = ValueType::Tensor {
            ty: TensorElementType::Float32,
            dimensions: vec![3, 4],
        };
        let err = bound_shape(&features, &fixed).unwrap_err();
        assert!(err.to_string().contains("does not hold 4 values"));
    }
}
