pub mod error;
pub mod tensor;
pub mod features;
pub mod vocab;
pub mod corpus;
pub mod model;
pub mod gate;
pub mod classifier;
pub mod recurrence;
pub mod optimizer;
pub mod learner;
pub mod gradient;
pub mod eval;
pub mod trainer;
pub mod baseline;
pub mod dqn;

pub use error::{LearnerError, Result};
pub use learner::GatedLogLinear;
