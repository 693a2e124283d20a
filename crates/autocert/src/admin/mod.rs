//! Operator tools: revocation, OCSP status and certificate checks

mod jws;
pub mod ocsp;
mod revoke;
mod validate;

pub use jws::{Jwk, Jws, JwsKey};
pub use ocsp::{CertStatus, OcspError, OcspStatus};
pub use revoke::{http_client, parse_reason, reason_code, revoke_with_account_key, Revoker};
pub use validate::{validate_host, validate_pem, ValidationReport};
