//! Fallback service naming
//!
//! When no service name is configured, the name is derived from the module
//! (crate) name of the running program: its MD5 digest in lower-case hex,
//! suffixed with `.services.local`.

/// Domain suffix appended to derived service names
pub const FALLBACK_NAME_SUFFIX: &str = ".services.local";

/// Lower-case hex MD5 digest of a module name
#[must_use]
pub fn module_digest(module_name: &str) -> String {
    let digest = md5::compute(module_name.trim().as_bytes());
    hex::encode(digest.0)
}

/// Service name used when none is configured
#[must_use]
pub fn fallback_service_name(module_name: &str) -> String {
    format!("{}{FALLBACK_NAME_SUFFIX}", module_digest(module_name)).to_lowercase()
}
