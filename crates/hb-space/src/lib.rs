//! Search-space representation and ask/tell optimizers.

pub mod optimizer;
pub mod space;

pub use optimizer::{
    build_optimizer, warm_start, ConfigInfo, Optimizer, OptimizerKind, PerturbOptimizer,
    RandomOptimizer,
};
pub use space::{ParameterDef, ParameterKind, SearchSpace};
