use crate::ir::OpId;

use std::fmt::{self, Display};

/// Names the operation a diagnostic is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRef {
    pub id: OpId,
    pub name: String,
}

impl Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.name, self.id)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// The operation is recognized but this combination of types or layouts is not handled.
    #[error("{op}: Not implemented: {message}")]
    NotImplemented { op: OpRef, message: String },
    /// The operation breaks a rule of the target's layout system.
    #[error("{op}: {message}")]
    Unsupported { op: OpRef, message: String },
    /// The IR does not have the structure the analysis requires.
    #[error("{op}: {message}")]
    Malformed { op: OpRef, message: String },
    #[error("{op}: failed to find a compatible layout in then and else branch for output {index}")]
    Unification { op: OpRef, index: usize },
    /// The function itself, rather than one of its operations, has the wrong structure.
    #[error("function '{function}': {message}")]
    InvalidFunction { function: String, message: String },
    #[error("{op}: failed to infer layout for {region}")]
    InRegion {
        op: OpRef,
        region: &'static str,
        #[source]
        source: Box<InferenceError>,
    },
}

impl InferenceError {
    /// The innermost error, looking through [InferenceError::InRegion] wrappers.
    pub fn root_cause(&self) -> &InferenceError {
        match self {
            InferenceError::InRegion { source, .. } => source.root_cause(),
            e => e,
        }
    }

    /// The operation the innermost error is about.
    pub fn op(&self) -> Option<&OpRef> {
        match self.root_cause() {
            InferenceError::NotImplemented { op, .. }
            | InferenceError::Unsupported { op, .. }
            | InferenceError::Malformed { op, .. }
            | InferenceError::Unification { op, .. }
            | InferenceError::InRegion { op, .. } => Some(op),
            InferenceError::InvalidFunction { .. } => None,
        }
    }

    /// The message of the innermost error, without the operation prefix.
    pub fn message(&self) -> String {
        match self.root_cause() {
            InferenceError::NotImplemented { message, .. }
            | InferenceError::Unsupported { message, .. }
            | InferenceError::Malformed { message, .. }
            | InferenceError::InvalidFunction { message, .. } => message.clone(),
            e => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op_ref() -> OpRef {
        OpRef {
            id: OpId(7),
            name: "scf.if".to_owned(),
        }
    }

    #[test]
    fn test_display_names_the_op() {
        let e = InferenceError::Unification {
            op: op_ref(),
            index: 1,
        };
        assert_eq!(
            e.to_string(),
            "'scf.if' (op7): failed to find a compatible layout in then and else branch for output 1"
        );
    }

    #[test]
    fn test_root_cause_unwraps_region_context() {
        let inner = InferenceError::NotImplemented {
            op: OpRef {
                id: OpId(2),
                name: "tpu.rotate".to_owned(),
            },
            message: "Rotate with non-32-bit data".to_owned(),
        };
        let wrapped = InferenceError::InRegion {
            op: op_ref(),
            region: "then branch",
            source: Box::new(inner.clone()),
        };
        assert_eq!(wrapped.root_cause(), &inner);
        assert_eq!(wrapped.op().map(|op| op.id), Some(OpId(2)));
        assert_eq!(wrapped.message(), "Rotate with non-32-bit data");
    }
}
