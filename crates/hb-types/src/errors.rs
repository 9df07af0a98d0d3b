use thiserror::Error;

/// Main error type for the Hyperbracket system
#[derive(Error, Debug)]
pub enum HbError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Setup-time errors: invalid iteration-generator or search-space parameters.
/// Always fatal, surfaced immediately, never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Downsampling factor eta must be > 1, got {eta}")]
    InvalidEta { eta: f64 },

    #[error("Invalid budget range: min_budget {min} must not exceed max_budget {max}")]
    InvalidBudgetRange { min: f64, max: f64 },

    #[error("Mismatched schedule lengths: {n_configs_len} config counts vs {budgets_len} budgets")]
    MismatchedSchedule {
        n_configs_len: usize,
        budgets_len: usize,
    },

    #[error("Iteration schedule must contain at least one rung")]
    EmptySchedule,

    #[error("Search space has no parameters")]
    EmptySpace,

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Optimizer contract violations. These indicate a bug in the caller
/// (typically the master), so they propagate instead of being retried.
#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimizer not initialized: call initialize() before ask()/tell()")]
    NotFitted,

    #[error("Unknown budget {budget}: optimizer was initialized with budgets {known:?}")]
    InvalidBudget { budget: f64, known: Vec<f64> },
}

/// Name-registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Address {address} already claimed by worker {claimed_by}")]
    DuplicateAddress {
        address: String,
        claimed_by: String,
    },

    #[error("Cannot bind registry to {host}:{port}: port in use")]
    PortInUse { host: String, port: u16 },

    #[error("Unknown worker: {worker_id}")]
    UnknownWorker { worker_id: String },

    #[error("Registry has been shut down")]
    ShutDown,
}

/// Transport failures between master and workers. Retried with bounded
/// backoff; after the retry budget they degrade to a per-job failure.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Worker {worker_id} unreachable after {attempts} dispatch attempts")]
    WorkerUnreachable { worker_id: String, attempts: u32 },
}

/// Failures inside the user evaluation callable. Captured per job; the run
/// continues.
#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Evaluation function returned an error: {message}")]
    Raised { message: String },

    #[error("Evaluation function panicked: {message}")]
    Panicked { message: String },

    #[error("Evaluation produced an invalid result: {message}")]
    InvalidResult { message: String },
}

/// Run-level failures reported by the driver.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("No job ever completed: the run produced no usable observations")]
    NoCompletedJobs,
}

/// Result type alias for Hyperbracket operations
pub type HbResult<T> = Result<T, HbError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HbError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HbError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidEta { eta: 1.0 };
        assert!(error.to_string().contains("eta"));
        assert!(error.to_string().contains('1'));

        let error = TransportError::WorkerUnreachable {
            worker_id: "worker-3".into(),
            attempts: 3,
        };
        assert!(error.to_string().contains("worker-3"));
    }

    #[test]
    fn test_error_conversion() {
        let config_error = ConfigError::EmptySchedule;
        let hb_error: HbError = config_error.into();

        match hb_error {
            HbError::Config(_) => (),
            _ => panic!("Expected Config error"),
        }

        let opt_error = OptimizerError::NotFitted;
        let hb_error: HbError = opt_error.into();
        assert!(matches!(hb_error, HbError::Optimizer(_)));
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
    }
}
