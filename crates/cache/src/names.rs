//! Cache entry naming convention.
//!
//! Entry names decide which tier an artifact lives in. Issued certificates
//! are keyed by plain hostname and are shared across the fleet. Everything
//! private to the renewing machine (the ACME account, challenge tokens, RSA
//! fallback material) stays in the local directory.
//!
//! | Name                 | Tier   |
//! |----------------------|--------|
//! | `example.com`        | shared |
//! | `example.com+rsa`    | local  |
//! | `example.com+token`  | local  |
//! | `<token>+http-01`    | local  |
//! | `acme_account+key`   | local  |

/// Name under which the ACME account credentials are stored.
pub const ACCOUNT_KEY_NAME: &str = "acme_account+key";

/// Suffix appended to challenge tokens.
pub const HTTP01_TOKEN_SUFFIX: &str = "+http-01";

/// Suffix for RSA certificate bundles.
pub const RSA_SUFFIX: &str = "+rsa";

/// Suffix for transient ACME token material.
pub const TOKEN_SUFFIX: &str = "+token";

const LOCAL_SUFFIXES: [&str; 2] = [TOKEN_SUFFIX, RSA_SUFFIX];
const HTTP01_MARKER: &str = "http-01";
const ACCOUNT_PREFIX: &str = "acme_account";
const ACCOUNT_SUFFIX: &str = "key";

/// Returns true if `name` must be kept in the local, lock-protected cache.
///
/// This is the only routing decision in the store. Misclassifying a name
/// either leaks private key material to the shared tier or prevents a
/// certificate from being shared, so the rules are matched literally.
pub fn is_local_name(name: &str) -> bool {
    LOCAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        || name.contains(HTTP01_MARKER)
        || (name.starts_with(ACCOUNT_PREFIX) && name.ends_with(ACCOUNT_SUFFIX))
}

/// Cache name for an HTTP-01 challenge token.
pub fn http01_token_name(token: &str) -> String {
    format!("{token}{HTTP01_TOKEN_SUFFIX}")
}
