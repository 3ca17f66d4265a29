use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize};

use crate::inference::slot::{InferenceError, InferenceSlot};

#[derive(Deserialize, Debug)]
pub struct ClassifyRequest {
    #[serde(default, deserialize_with = "deserialize_features")]
    pub input_data: Vec<f32>,
}

/// Decodes the features as `f64` and rejects any that do not fit a finite
/// `f32`, which would otherwise turn into infinity.
fn deserialize_features<'de, D>(deserializer: D) -> Result<Vec<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = Vec::<f64>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| {
            let feature = value as f32;
            if feature.is_finite() {
                Ok(feature)
            } else {
                Err(D::Error::custom(format!(
                    "input value {} is out of range for float32",
                    value
                )))
            }
        })
        .collect()
}

#[derive(Deserialize, Serialize, Debug, PartialEq)]
pub struct ClassifyResponse {
    pub input_data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Vec<i64>>,
}

impl ClassifyResponse {
    /// Echoes the features back without running the model.
    pub fn echo(request: ClassifyRequest) -> Self {
        Self {
            input_data: request.input_data,
            prediction: None,
        }
    }
}

pub trait ClassifyHandler {
    fn run_classify(&self, request: ClassifyRequest) -> Result<ClassifyResponse, InferenceError>;
}

impl ClassifyHandler for InferenceSlot {
    #[tracing::instrument(level = "info", skip(self))]
    fn run_classify(&self, request: ClassifyRequest) -> Result<ClassifyResponse, InferenceError> {
        let prediction = self.infer(&request.input_data)?;

        Ok(ClassifyResponse {
            input_data: request.input_data,
            prediction: Some(prediction),
        })
    }
}
