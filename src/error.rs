use thiserror::Error;

/// Unrecoverable lowering failure, aborting the current compilation unit.
///
/// Missed optimizations are never errors, only `bool`/`Option` outcomes of the
/// respective transforms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LowerError {
    #[error("runtime library function `{0}` not found")]
    MissingRuntimeFunc(String),

    #[error("runtime library function `{name}` has an unexpected signature: {reason}")]
    RuntimeFuncSignature { name: String, reason: String },

    #[error("ray-tracing operation `{0}` has no runtime library mapping")]
    UnmappedRtOp(&'static str),

    #[error("can't convert {from} to {to} for intrinsic '{op}'")]
    ArgTypeMismatch {
        from: String,
        to: String,
        op: String,
    },

    #[error("unsupported use of pointer in address space rewrite: {0}")]
    UnsupportedPointerUse(String),

    #[error("required module metadata `{0}` is missing")]
    MissingMetadata(&'static str),

    #[error("module metadata `{key}` is invalid: {reason}")]
    InvalidMetadata { key: &'static str, reason: String },

    #[error("existing global variable `{name}` can't be reused: {reason}")]
    ConflictingGlobalVar { name: &'static str, reason: String },

    #[error("Missing stack addrspace metadata!")]
    MissingStackAddrSpace,

    #[error("system data of type {system_data} does not contain {wanted}")]
    InvalidSystemData { system_data: String, wanted: String },
}
