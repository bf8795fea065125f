use tessera_cache::CacheError;

use crate::storage::Operation;

/// Contract violations: malformed schemas, wrong argument shapes and
/// unsupported adapter operations.
///
/// These are returned synchronously and never cached. Failures of the data
/// itself (adapter errors, missing records) are [`crate::ModelError`] values
/// instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The reserved `id` field was declared with something other than `true`.
    #[error("the 'id' field must be declared as true, found {found}")]
    InvalidIdentifier { found: &'static str },

    /// A field default is not a primitive, function, object or array.
    #[error("invalid default for field '{key}': {found}")]
    InvalidDefault { key: String, found: &'static str },

    /// A primitive array default is empty or holds non-primitive values.
    #[error("the value for the '{key}' array must be a string, number or boolean: {found}")]
    InvalidArrayElement { key: String, found: &'static str },

    /// The options slot of a model array is not an options object.
    #[error("options for '{key}' array field must be an options object: {found}")]
    InvalidListOptions { key: String, found: &'static str },

    /// A list was requested for a model without an `id` field.
    #[error("model definition must have an 'id' field declared as true")]
    NotEnumerable,

    /// The connected adapter does not implement the operation.
    #[error("model definition storage must support '{0}'")]
    Unsupported(Operation),

    /// Parameters were passed for a model without an `id` field.
    #[error("model definition must have an 'id' field to support parameters")]
    ParametersNotSupported,

    /// A parameter object held a non-primitive value.
    #[error("parameter '{key}' must be a primitive value: {found}")]
    NestedParameter { key: String, found: &'static str },

    /// Parameters were neither a primitive nor a flat object.
    #[error("parameters must be a primitive value or an object: {found}")]
    InvalidParameters { found: &'static str },

    /// Model values must be an object.
    #[error("model values must be an object: {found}")]
    NotAnObject { found: &'static str },

    /// An array field received a non-array value.
    #[error("the value for '{key}' field must be an array: {found}")]
    NotAnArray { key: String, found: &'static str },

    /// Values passed to `set` carried an `id`.
    #[error("values must not have an 'id' field")]
    IdInValues,

    /// A model instance of another schema was passed where a specific schema
    /// is declared.
    #[error("model instance must match the definition")]
    ModelMismatch,

    /// An item of a list of non-enumerable models is not an object.
    #[error("list item must be an object: {found}")]
    ItemNotAnObject { found: &'static str },

    /// Storage returned a record whose id differs from the updated instance.
    #[error("local and storage data must have the same id: '{local}', '{remote}'")]
    IdMismatch { local: String, remote: String },

    /// A declared field was read on a placeholder.
    #[error("tried to get '{key}' in pending state; check pending() or ready() first")]
    Pending { key: String },

    /// A declared field was read on an error instance.
    #[error("tried to get '{key}' in error state; check error() first")]
    ErrorState { key: String },

    /// The key is not a field of the model.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// The instance is no longer tracked: it was superseded by a newer
    /// instance or is a placeholder.
    #[error("model instance is not connected to a definition")]
    Untracked,

    /// `clear` was called with something other than a definition, a model or
    /// an error instance.
    #[error("clear target must be a model instance, an error or a definition: {found}")]
    NotClearable { found: &'static str },

    /// The scheduler had no runtime to run background work on.
    #[error("no async runtime available to run store tasks")]
    NoRuntime,

    /// The store owning the instance was dropped.
    #[error("the owning store has been dropped")]
    Detached,

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
