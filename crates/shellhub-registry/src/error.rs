use std::collections::HashMap;

/// Error kinds used consistently across the registry API boundary.
///
/// The HTTP layer maps these onto stable status codes; payloads carry the
/// offending data (conflicting fields, exceeded limit, …).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("not found: {id}")]
    NotFound { id: String },
    #[error("duplicated fields: {fields:?}")]
    Duplicated { fields: Vec<String> },
    #[error("limit exceeded: {limit}")]
    Limit { limit: i64 },
    #[error("invalid fields: {fields:?}")]
    Invalid { fields: HashMap<String, String> },
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    /// A member tried to act on a role at or above its own authority.
    #[error("role authority violation")]
    RoleInvalid,
    /// Accepting the device needs a billing decision first.
    #[error("payment required")]
    Payment,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("unknown registry failure: {reason}")]
    Unknown { reason: String },
}

impl RegistryError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn duplicated<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Duplicated {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn invalid(field: impl Into<String>, value: impl Into<String>) -> Self {
        let mut fields = HashMap::new();
        fields.insert(field.into(), value.into());
        Self::Invalid { fields }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown { reason: reason.into() }
    }
}
