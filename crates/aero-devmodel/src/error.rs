use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DevModelError {
    #[error("type `{0}` is already registered")]
    DuplicateType(String),
    #[error("unknown type `{0}`")]
    UnknownType(String),
    #[error("type `{0}` would be its own ancestor")]
    CyclicType(String),
    #[error("type `{0}` is abstract and cannot be instantiated")]
    AbstractType(String),
    #[error("duplicate property `{0}`")]
    DuplicateProperty(String),
    #[error("property `{0}` not found")]
    UnknownProperty(String),
    #[error("`{name}` is not of type `{expected}`")]
    TypeMismatch { name: String, expected: String },
    #[error("access to property `{0}` denied")]
    PermissionDenied(String),
    #[error("device `{0}` not found")]
    DeviceNotFound(String),
    #[error("bus `{0}` does not support hot-plugging")]
    BusNoHotplug(String),
    #[error("device `{0}` is still in use")]
    DeviceInUse(String),
    #[error("property `{property}` does not accept value `{value}`")]
    InvalidParameter { property: String, value: String },
    #[error("initialization of device `{type_name}` failed: {reason}")]
    RealizeFailed { type_name: String, reason: String },
}

pub type Result<T, E = DevModelError> = std::result::Result<T, E>;
