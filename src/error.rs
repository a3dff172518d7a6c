use thiserror::Error;

use crate::bytecode::Position;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! verification_error {
    ($pos:expr, $msg:expr) => {
        crate::Error::Verification {
            position: $pos,
            message: $msg.to_string(),
        }
    };

    ($pos:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::Verification {
            position: $pos,
            message: format!($fmt, $($arg)*),
        }
    };
}

/// The budget that was exhausted by a [`Error::BudgetExceeded`] failure.
///
/// Budget failures are fatal for the current attempt only. A policy layer can tell
/// them apart from verification failures and retry the unit with a different
/// configuration (for instance with inlining disabled after [`BudgetKind::TooDeepInlining`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    /// An accepted inlining decision would nest deeper than `max_inlining_depth`.
    TooDeepInlining {
        /// The inlining depth at which the call site was found.
        depth: usize,
    },
    /// The graph grew beyond `max_node_count` live nodes.
    NodeCount {
        /// The configured node limit.
        limit: usize,
    },
    /// The configured build deadline passed.
    Deadline,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::TooDeepInlining { depth } => write!(f, "too deep inlining (depth {depth})"),
            BudgetKind::NodeCount { limit } => write!(f, "node count exceeds {limit}"),
            BudgetKind::Deadline => write!(f, "deadline exceeded"),
        }
    }
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// A failed build never hands out a graph: every fatal condition is reported through this
/// enum and the partially built graph is dropped with the builder.
///
/// # Error Categories
///
/// ## Unit-level compile failures
/// - [`Error::Verification`] - The bytecode is inconsistent (stack shape mismatch at a merge,
///   unbalanced monitors, stack underflow, undefined locals on a back edge). Not retried.
/// - [`Error::BudgetExceeded`] - Inlining too deep, too many nodes, deadline passed.
///   Fatal for this attempt only.
///
/// ## Input errors
/// - [`Error::Malformed`] - Structurally invalid method body or block map
/// - [`Error::UndefinedLabel`] - The assembler saw a reference to an unknown label
/// - [`Error::NotSupported`] - Input the builder deliberately does not handle (irreducible loops)
/// - [`Error::UnresolvedRoot`] - The method to compile could not be resolved at all
///
/// Unresolved references inside a method and missing profile data are recovered locally
/// and never surface here.
///
/// # Examples
///
/// ```rust,ignore
/// use bytegraph::{Error, GraphBuilder};
///
/// match builder.build(method) {
///     Ok(built) => println!("{} nodes", built.graph.node_count()),
///     Err(e) if e.is_too_deep_inlining() => { /* retry with inlining disabled */ }
///     Err(Error::Verification { position, message }) => eprintln!("{position}: {message}"),
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The bytecode failed verification while the graph was being built.
    ///
    /// Raised for stack-shape mismatches at control-flow joins, unbalanced monitor
    /// enter/exit pairs, operand stack underflow, operand kind mismatches and locals
    /// that are live at a loop header but undefined on one of its back edges.
    #[error("Verification failed at {position}: {message}")]
    Verification {
        /// The instruction position at which the inconsistency was detected
        position: Position,
        /// Description of the inconsistency
        message: String,
    },

    /// A resource budget of the current build attempt was exhausted.
    #[error("Budget exceeded at {position}: {kind}")]
    BudgetExceeded {
        /// The instruction position being processed when the budget ran out
        position: Position,
        /// Which budget was exhausted
        kind: BudgetKind,
    },

    /// The input is damaged and could not be processed.
    ///
    /// The error includes the source location where the malformation was detected
    /// for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// A branch referenced a label that was never defined.
    #[error("Undefined label - {0}")]
    UndefinedLabel(String),

    /// The input uses a construct the builder does not support.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// The method requested for compilation could not be resolved.
    #[error("Unresolved compilation root - {0}")]
    UnresolvedRoot(String),
}

impl Error {
    /// Returns `true` if this error is a [`Error::BudgetExceeded`] failure.
    #[must_use]
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, Error::BudgetExceeded { .. })
    }

    /// Returns `true` if this error is the distinguishable too-deep-inlining failure.
    #[must_use]
    pub fn is_too_deep_inlining(&self) -> bool {
        matches!(
            self,
            Error::BudgetExceeded {
                kind: BudgetKind::TooDeepInlining { .. },
                ..
            }
        )
    }

    /// Returns `true` if this error is a [`Error::Verification`] failure.
    #[must_use]
    pub fn is_verification(&self) -> bool {
        matches!(self, Error::Verification { .. })
    }

    /// Returns the instruction position attached to the error, if any.
    #[must_use]
    pub fn position(&self) -> Option<Position> {
        match self {
            Error::Verification { position, .. } | Error::BudgetExceeded { position, .. } => {
                Some(*position)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_classification() {
        let err = Error::BudgetExceeded {
            position: Position::new(4),
            kind: BudgetKind::TooDeepInlining { depth: 3 },
        };
        assert!(err.is_budget_exceeded());
        assert!(err.is_too_deep_inlining());
        assert!(!err.is_verification());
        assert_eq!(err.position(), Some(Position::new(4)));

        let err = Error::BudgetExceeded {
            position: Position::new(0),
            kind: BudgetKind::NodeCount { limit: 10 },
        };
        assert!(err.is_budget_exceeded());
        assert!(!err.is_too_deep_inlining());
    }

    #[test]
    fn test_verification_macro() {
        let err = verification_error!(Position::new(7), "stack depth {} != {}", 1, 2);
        assert!(err.is_verification());
        assert_eq!(
            err.to_string(),
            "Verification failed at @7: stack depth 1 != 2"
        );
    }

    #[test]
    fn test_malformed_macro() {
        let err = malformed_error!("bad block {}", 3);
        match err {
            Error::Malformed { message, file, .. } => {
                assert_eq!(message, "bad block 3");
                assert!(file.ends_with("error.rs"));
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
        assert!(Error::NotSupported("x".into()).position().is_none());
    }
}
