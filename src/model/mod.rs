//! Model module: registry, weight sources and inference backends

mod backend;
mod candle;
mod registry;
mod source;

pub use backend::{Fragment, FragmentStream, InferenceBackend, InferenceModel, LoadSpec};
pub use candle::{CandleBackend, CandleConfig, CandleModel};
pub use registry::{ModelInstance, ModelRegistry, ModelState};
pub use source::{HubSource, WeightSource};
