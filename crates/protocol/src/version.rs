//! Control-plane API version.

/// Version of the newline-delimited JSON wire protocol spoken by the API
/// server. Clients may use this to detect incompatible future revisions.
pub const API_VERSION: u32 = 1;
