pub mod onnx;
pub mod slot;
pub mod task;

/// Features per request for the served iris classifier.
pub const FEATURE_ARITY: usize = 4;

/// Labels produced per request.
pub const LABEL_ARITY: usize = 1;
