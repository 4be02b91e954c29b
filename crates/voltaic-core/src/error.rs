//! Error types shared across the Voltaic workspace.

use thiserror::Error;

/// Classification of circuit wiring problems detected during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyError {
    /// A node with no DC path to ground.
    FloatingNode,
    /// A loop made entirely of voltage sources and/or inductors.
    VoltageSourceLoop,
}

impl std::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyError::FloatingNode => write!(f, "floating node"),
            TopologyError::VoltageSourceLoop => write!(f, "voltage source loop"),
        }
    }
}

/// Errors that can occur while building or running a simulation.
///
/// Numerical failures (`SingularMatrix`, `NoConvergence`) are recovered
/// locally by the Newton solver where possible; setup-time errors are fatal
/// and surface immediately.
#[derive(Debug, Error)]
pub enum Error {
    /// LU factorisation hit a zero pivot. The row identifies the pivot.
    #[error("singular matrix at row {0}")]
    SingularMatrix(usize),

    /// Newton-Raphson exceeded its iteration cap.
    #[error("no convergence after {0} iterations")]
    NoConvergence(usize),

    /// The transient timestep controller hit its lower bound.
    #[error("timestep {delta:.3e} too small at t = {time:.3e}")]
    TimestepTooSmall { time: f64, delta: f64 },

    /// A device was wired with the wrong number of pins.
    #[error("device `{name}`: expected {expected} pins, got {got}")]
    PinCountMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    /// A required parameter was never given.
    #[error("required parameter `{0}` was not given")]
    MissingParameter(String),

    /// A model parameter was given a value outside its legal range.
    #[error("parameter `{name}` out of range: {value}")]
    ModelParameterOutOfRange { name: String, value: f64 },

    /// The circuit graph itself is unsolvable.
    #[error("circuit topology error: {0}")]
    CircuitTopology(TopologyError),

    /// A parameter or option name was not recognised.
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    /// No behavior factory is registered for this entity kind.
    #[error("unknown entity kind `{0}`")]
    UnknownEntityKind(String),

    /// An entity referenced by name does not exist in the circuit.
    #[error("no such entity `{0}`")]
    NoSuchEntity(String),

    /// An entity referenced a model card that does not exist.
    #[error("entity `{entity}` references missing model `{model}`")]
    MissingModel { entity: String, model: String },

    /// Vector or matrix dimensions do not agree.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The simulation was cancelled through its cancellation token.
    #[error("simulation cancelled")]
    Cancelled,
}

/// Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
