use std::sync::Mutex;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, info};

/// A loaded model whose run operation reads a fixed-length `f32` input and
/// fills a fixed-length `i64` output.
///
/// Implementations give no concurrency guarantee of their own; the
/// [`InferenceSlot`] owning the session serializes every call to [`run`].
///
/// [`run`]: ModelSession::run
pub trait ModelSession: Send {
    /// Number of features the model expects per call.
    fn input_arity(&self) -> usize;

    /// Number of labels the model produces per call.
    fn output_arity(&self) -> usize;

    /// Runs the model once. `input` and `output` always have exactly
    /// `input_arity()` and `output_arity()` elements.
    fn run(&mut self, input: &[f32], output: &mut [i64]) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Input data must be an array of {expected} float32 values, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("Inference failed: {0:#}")]
    Run(anyhow::Error),

    #[error("Inference slot is in an inconsistent state after a previous failure")]
    Poisoned,

    #[error("Inference slot has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Ready,
    Destroyed,
}

/// Session plus the buffers bound to it. Fields are released in declaration
/// order on shutdown.
struct BoundSession {
    session: Box<dyn ModelSession>,
    input: Box<[f32]>,
    output: Box<[i64]>,
}

/// Single inference slot shared by every request handler.
///
/// One lock covers the copy into the input buffer, the run and the copy out of
/// the output buffer, so at most one inference executes at a time and a
/// returned prediction always belongs to the features that were passed in.
pub struct InferenceSlot {
    bound: Mutex<Option<BoundSession>>,
    input_arity: usize,
    output_arity: usize,
}

impl InferenceSlot {
    /// Allocates the input and output buffers for `session` and binds them.
    #[tracing::instrument(level = "info", skip(session))]
    pub fn bind(session: Box<dyn ModelSession>) -> Self {
        let input_arity = session.input_arity();
        let output_arity = session.output_arity();
        let bound = BoundSession {
            session,
            input: vec![0f32; input_arity].into_boxed_slice(),
            output: vec![0i64; output_arity].into_boxed_slice(),
        };
        info!(input_arity, output_arity, "Inference slot ready");

        Self {
            bound: Mutex::new(Some(bound)),
            input_arity,
            output_arity,
        }
    }

    pub fn input_arity(&self) -> usize {
        self.input_arity
    }

    pub fn output_arity(&self) -> usize {
        self.output_arity
    }

    pub fn state(&self) -> SlotState {
        let ready = match self.bound.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };
        if ready {
            SlotState::Ready
        } else {
            SlotState::Destroyed
        }
    }

    /// Copies `features` into the input buffer, runs the session and returns a
    /// copy of the output buffer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn infer(&self, features: &[f32]) -> Result<Vec<i64>, InferenceError> {
        if features.len() != self.input_arity {
            return Err(InferenceError::Arity {
                expected: self.input_arity,
                actual: features.len(),
            });
        }

        let mut guard = self.bound.lock().map_err(|_| {
            error!("Inference slot lock is poisoned");
            InferenceError::Poisoned
        })?;
        let bound = guard.as_mut().ok_or(InferenceError::ShutDown)?;

        bound.input.copy_from_slice(features);
        bound
            .session
            .run(&bound.input, &mut bound.output)
            .map_err(|err| {
                error!("Model run failed: {:#}", err);
                InferenceError::Run(err)
            })?;
        let prediction = bound.output.to_vec();
        debug!(?prediction, "Inference finished");

        Ok(prediction)
    }

    /// Waits for any in-flight inference to finish, then releases the session
    /// and both buffers. Calling it again is a no-op.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn shutdown(&self) {
        let mut guard = match self.bound.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(BoundSession {
            session,
            input,
            output,
        }) = guard.take()
        else {
            debug!("Inference slot already released");
            return;
        };

        drop(session);
        debug!("Released model session");
        drop(input);
        drop(output);
        debug!("Released input and output buffers");
        info!("Inference slot shut down");
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use super::testing::ArgmaxSession;
    use super::*;

    #[test]
    fn infer_returns_one_label() {
        let (session, runs) = ArgmaxSession::new();
        let slot = InferenceSlot::bind(Box::new(session));

        let features = [5.1, 3.5, 1.4, 0.2];
        let prediction = slot.infer(&features).unwrap();

        assert_eq!(prediction, vec![ArgmaxSession::expected_label(&features)]);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(slot.output_arity(), 1);
    }

    #[test]
    fn wrong_arity_never_runs_the_session() {
        let (session, runs) = ArgmaxSession::new();
        let slot = InferenceSlot::bind(Box::new(session));

        let err = slot.infer(&[1.0, 2.0, 3.0]).unwrap_err();

        assert!(matches!(
            err,
            InferenceError::Arity {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_input_gives_same_label() {
        let (session, _) = ArgmaxSession::new();
        let slot = InferenceSlot::bind(Box::new(session));

        let first = slot.infer(&[6.3, 3.3, 6.0, 2.5]).unwrap();
        slot.infer(&[4.9, 3.0, 1.4, 0.2]).unwrap();
        let again = slot.infer(&[6.3, 3.3, 6.0, 2.5]).unwrap();

        assert_eq!(first, again);
    }

    #[test]
    fn run_failure_is_per_call() {
        let (mut session, runs) = ArgmaxSession::new();
        session.fail = true;
        let slot = InferenceSlot::bind(Box::new(session));

        assert!(matches!(
            slot.infer(&[1.0, 2.0, 3.0, 4.0]),
            Err(InferenceError::Run(_))
        ));
        assert!(matches!(
            slot.infer(&[1.0, 2.0, 3.0, 4.0]),
            Err(InferenceError::Run(_))
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(slot.state(), SlotState::Ready);
    }

    #[test]
    fn concurrent_calls_get_their_own_labels() {
        let (mut session, runs) = ArgmaxSession::new();
        session.delay = Duration::from_millis(2);
        let slot = InferenceSlot::bind(Box::new(session));

        thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let slot = &slot;
                    scope.spawn(move || {
                        let features = [i as f32, 1.0, 0.5, 0.25];
                        let prediction = slot.infer(&features).unwrap();
                        (features, prediction)
                    })
                })
                .collect();

            for handle in handles {
                let (features, prediction) = handle.join().unwrap();
                assert_eq!(prediction, vec![ArgmaxSession::expected_label(&features)]);
            }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn shutdown_releases_and_rejects_later_calls() {
        let (session, runs) = ArgmaxSession::new();
        let slot = InferenceSlot::bind(Box::new(session));

        slot.shutdown();
        slot.shutdown();

        assert_eq!(slot.state(), SlotState::Destroyed);
        assert!(matches!(
            slot.infer(&[1.0, 2.0, 3.0, 4.0]),
            Err(InferenceError::ShutDown)
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_waits_for_the_inference_in_flight() {
        let (mut session, runs) = ArgmaxSession::new();
        session.delay = Duration::from_millis(50);
        let completed = session.completed.clone();
        let slot = InferenceSlot::bind(Box::new(session));
        let features = [5.9, 3.0, 5.1, 1.8];

        thread::scope(|scope| {
            let in_flight = scope.spawn(|| slot.infer(&features));
            while runs.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }

            slot.shutdown();
            assert_eq!(completed.load(Ordering::SeqCst), 1);

            let prediction = in_flight.join().unwrap().unwrap();
            assert_eq!(prediction, vec![ArgmaxSession::expected_label(&features)]);
        });

        assert_eq!(slot.state(), SlotState::Destroyed);
        assert!(matches!(
            slot.infer(&features),
            Err(InferenceError::ShutDown)
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
