//! Error types shared by the kernel generator, the loop analyzer and the driver.
//!
//! Two families live here:
//! - [`CompilerError`] is a real failure. It aborts the current offload attempt
//!   (`InvalidProgram`, `HelperError`) or the whole compilation (`Fatal`,
//!   `Interrupted`).
//! - [`Stop`] is the outcome of one analyzer stage. A [`Rejection`] only drops
//!   the loop from the candidate set. A fatal stop is an internal invariant
//!   violation and is promoted to [`CompilerError::Fatal`].

use std::fmt;

use thiserror::Error;

use crate::ir::NodeId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompilerError {
    /// The method contains a construct the kernel generator cannot lower.
    #[error("invalid program: {0}")]
    InvalidProgram(String, Option<NodeId>),

    /// A device capability query failed.
    #[error("GPU helper error: {0}")]
    HelperError(String),

    /// Internal invariant violation; abandons the current compilation only.
    #[error("internal compiler error: {0}")]
    Fatal(String, Option<NodeId>),

    #[error("compilation interrupted (reason {0})")]
    Interrupted(u32),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CompilerError>;

impl CompilerError {
    /// The node the error is attached to, if any.
    pub fn node(&self) -> Option<NodeId> {
        match self {
            CompilerError::InvalidProgram(_, node) | CompilerError::Fatal(_, node) => *node,
            _ => None,
        }
    }

    /// Errors that abandon the compilation rather than just the offload attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompilerError::Fatal(..) | CompilerError::Interrupted(_))
    }
}

/// Return early with [`CompilerError::InvalidProgram`] attached to a node.
#[macro_export]
macro_rules! bail_invalid {
    ($node:expr, $($arg:tt)*) => {
        return Err($crate::err_invalid!($node, $($arg)*))
    };
}

#[macro_export]
macro_rules! err_invalid {
    ($node:expr, $($arg:tt)*) => {
        $crate::error::CompilerError::InvalidProgram(format!($($arg)*), Some($node))
    };
}

#[macro_export]
macro_rules! bail_fatal {
    ($node:expr, $($arg:tt)*) => {
        return Err($crate::error::CompilerError::Fatal(format!($($arg)*), $node))
    };
}

#[macro_export]
macro_rules! bail_helper {
    ($($arg:tt)*) => {
        return Err($crate::error::CompilerError::HelperError(format!($($arg)*)))
    };
}

// =============================================================================
// Analyzer outcomes
// =============================================================================

/// Analyzer stage that produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Shape,
    PerfectNest,
    DataLocality,
    Affine,
    Independence,
    Reduction,
    IterationPattern,
    SymbolMapping,
    ArrayAccess,
    TryGpuGuard,
    CpuBlockScan,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Shape => "shape",
            Stage::PerfectNest => "perfect nest",
            Stage::DataLocality => "data locality",
            Stage::Affine => "affine access",
            Stage::Independence => "independence",
            Stage::Reduction => "reduction",
            Stage::IterationPattern => "iteration pattern",
            Stage::SymbolMapping => "symbol mapping",
            Stage::ArrayAccess => "array access",
            Stage::TryGpuGuard => "tryGPU guard",
            Stage::CpuBlockScan => "CPU block scan",
        };
        write!(f, "{}", name)
    }
}

/// Why a loop was excluded from the offload or vectorization candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub stage: Stage,
    pub reason: String,
    pub node: Option<NodeId>,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{} check failed at node {}: {}", self.stage, node, self.reason),
            None => write!(f, "{} check failed: {}", self.stage, self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stop {
    Reject(Rejection),
    Fatal(String),
}

/// Result of one analyzer stage. `Ok(())` means keep going.
pub type Check = std::result::Result<(), Stop>;

impl Stop {
    pub fn reject(stage: Stage, reason: impl Into<String>) -> Self {
        Stop::Reject(Rejection {
            stage,
            reason: reason.into(),
            node: None,
        })
    }

    pub fn reject_at(stage: Stage, node: NodeId, reason: impl Into<String>) -> Self {
        Stop::Reject(Rejection {
            stage,
            reason: reason.into(),
            node: Some(node),
        })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Stop::Reject(r) => Some(r),
            Stop::Fatal(_) => None,
        }
    }
}

impl fmt::Display for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stop::Reject(r) => write!(f, "{}", r),
            Stop::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// Shorthand for `Err(Stop::reject(..))`.
pub fn reject<T>(stage: Stage, reason: impl Into<String>) -> std::result::Result<T, Stop> {
    Err(Stop::reject(stage, reason))
}
