//! Typed variadic arguments pushed by the `0b0001011` custom opcode.

use crate::error::{ScriptError, ScriptResult};

/// One argument pushed via the dynarg-push opcode. Funct3 of the opcode
/// selects the variant: `000` imm-i32 (sign-extended into I64), `001`
/// i64-reg, `010` f32-reg, `111` string-reg (zero-terminated guest string).
#[derive(Debug, Clone, PartialEq)]
pub enum DynArg {
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
}

impl DynArg {
    fn type_name(&self) -> &'static str {
        match self {
            DynArg::I64(_) => "i64",
            DynArg::F32(_) => "f32",
            DynArg::F64(_) => "f64",
            DynArg::Str(_) => "str",
        }
    }

    pub fn as_i64(&self) -> ScriptResult<i64> {
        match self {
            DynArg::I64(v) => Ok(*v),
            other => Err(ScriptError::DynArgTypeMismatch {
                expected: "i64",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_f32(&self) -> ScriptResult<f32> {
        match self {
            DynArg::F32(v) => Ok(*v),
            other => Err(ScriptError::DynArgTypeMismatch {
                expected: "f32",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_f64(&self) -> ScriptResult<f64> {
        match self {
            DynArg::F64(v) => Ok(*v),
            other => Err(ScriptError::DynArgTypeMismatch {
                expected: "f64",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_str(&self) -> ScriptResult<&str> {
        match self {
            DynArg::Str(v) => Ok(v.as_str()),
            other => Err(ScriptError::DynArgTypeMismatch {
                expected: "str",
                found: other.type_name(),
            }),
        }
    }
}

/// Ordered, accumulated argument list for one variadic dynamic call.
///
/// Populated by the dynarg-push opcode handler in call order, read by the
/// dispatched handler, and cleared by the host after the with-args syscall
/// variant completes (see the dynamic-call dispatch rules).
#[derive(Debug, Clone, Default)]
pub struct DynArgs {
    values: Vec<DynArg>,
}

impl DynArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: DynArg) {
        self.values.push(arg);
    }

    pub fn get(&self, index: usize) -> Option<&DynArg> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynArg> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_push_order() {
        let mut args = DynArgs::new();
        args.push(DynArg::I64(1234));
        args.push(DynArg::F32(5678.0));
        args.push(DynArg::Str("nine-ten-eleven-twelve!".into()));

        assert_eq!(args.len(), 3);
        assert_eq!(args.get(0).unwrap().as_i64().unwrap(), 1234);
        assert_eq!(args.get(1).unwrap().as_f32().unwrap(), 5678.0);
        assert_eq!(args.get(2).unwrap().as_str().unwrap(), "nine-ten-eleven-twelve!");
    }

    #[test]
    fn clear_empties_for_next_call() {
        let mut args = DynArgs::new();
        args.push(DynArg::I64(1));
        args.clear();
        assert!(args.is_empty());
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut args = DynArgs::new();
        args.push(DynArg::I64(1));
        let err = args.get(0).unwrap().as_str().unwrap_err();
        assert_eq!(err.category(), "dyncall");
    }
}
