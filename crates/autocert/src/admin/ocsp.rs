//! OCSP status queries
//!
//! Builds a single-certificate OCSP request (SHA-1 CertID, as every public
//! responder expects) and reads the status for that certificate out of the
//! response. The responder's signature is not checked: the result is
//! informational and the transport is the only trust anchor.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use thiserror::Error;
use tracing::debug;
use x509_parser::asn1_rs::{
    Any, Class, Enumerated, FromDer, GeneralizedTime, Integer, Null, OctetString, Oid, Sequence,
    Tag, ToDer,
};
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::oid_registry::{OID_HASH_SHA1, OID_PKIX_ACCESS_DESCRIPTOR_OCSP};
use x509_parser::prelude::X509Certificate;

/// id-pkix-ocsp-basic
const OCSP_BASIC: &str = "1.3.6.1.5.5.7.48.1.1";

#[derive(Debug, Error)]
pub enum OcspError {
    #[error("malformed OCSP response: {0}")]
    Malformed(&'static str),

    #[error("OCSP responder returned status {0} ({name})", name = response_status_name(*.0))]
    Unsuccessful(u32),

    #[error("certificate names no OCSP responder")]
    NoResponder,

    #[error("OCSP response does not cover the certificate")]
    NotInResponse,

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("cannot encode OCSP request: {0}")]
    Encoding(String),

    #[error("OCSP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

fn response_status_name(status: u32) -> &'static str {
    match status {
        1 => "malformedRequest",
        2 => "internalError",
        3 => "tryLater",
        5 => "sigRequired",
        6 => "unauthorized",
        _ => "unknown",
    }
}

/// Revocation state reported by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked {
        revoked_at: DateTime<Utc>,
        reason: Option<u32>,
    },
    Unknown,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertStatus::Good => f.write_str("good"),
            CertStatus::Unknown => f.write_str("unknown"),
            CertStatus::Revoked {
                revoked_at,
                reason: Some(reason),
            } => write!(f, "revoked at {revoked_at} (reason {reason})"),
            CertStatus::Revoked { revoked_at, .. } => write!(f, "revoked at {revoked_at}"),
        }
    }
}

/// Status of one certificate from an OCSP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcspStatus {
    pub status: CertStatus,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
}

/// The responder URL from the certificate's AuthorityInfoAccess extension.
pub fn responder_url(leaf_der: &[u8]) -> Result<String, OcspError> {
    let (_, cert) = parse_cert(leaf_der)?;
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Ok(uri.to_string());
                    }
                }
            }
        }
    }
    Err(OcspError::NoResponder)
}

/// DER OCSPRequest for `leaf_der`, issued by `issuer_der`.
pub fn build_request(leaf_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>, OcspError> {
    let request = sequence(&[cert_id(leaf_der, issuer_der)?])?;
    let request_list = sequence(&[request])?;
    let tbs_request = sequence(&[request_list])?;
    sequence(&[tbs_request])
}

fn cert_id(leaf_der: &[u8], issuer_der: &[u8]) -> Result<Vec<u8>, OcspError> {
    let (_, leaf) = parse_cert(leaf_der)?;
    let (_, issuer) = parse_cert(issuer_der)?;

    let name_hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, issuer.subject().as_raw());
    let key_hash = digest(
        &SHA1_FOR_LEGACY_USE_ONLY,
        &issuer.public_key().subject_public_key.data,
    );

    let algorithm = sequence(&[encode(&OID_HASH_SHA1)?, encode(&Null::new())?])?;
    sequence(&[
        algorithm,
        encode(&OctetString::new(name_hash.as_ref()))?,
        encode(&OctetString::new(key_hash.as_ref()))?,
        encode(&Integer::new(leaf.raw_serial()))?,
    ])
}

/// Status of the certificate with serial `serial` (DER INTEGER content).
pub fn parse_response(der: &[u8], serial: &[u8]) -> Result<OcspStatus, OcspError> {
    let (_, response) = universal(der, Tag::Sequence, "OCSPResponse")?;
    let (rest, status) = parse::<Enumerated>(response, "responseStatus")?;
    if status.0 != 0 {
        return Err(OcspError::Unsuccessful(status.0));
    }

    let (_, bytes) = context(rest, 0, "responseBytes")?;
    let (_, bytes) = universal(bytes, Tag::Sequence, "responseBytes")?;
    let (rest, kind) = parse::<Oid>(bytes, "responseType")?;
    if kind.to_id_string() != OCSP_BASIC {
        return Err(OcspError::Malformed("not a basic OCSP response"));
    }
    let (_, basic) = parse::<OctetString>(rest, "response")?;
    let (_, basic) = universal(basic.as_ref(), Tag::Sequence, "BasicOCSPResponse")?;
    let (_, data) = universal(basic, Tag::Sequence, "tbsResponseData")?;

    // Optional version, then responderID.
    let (mut rest, first) = element(data, "responderID")?;
    if is_context(&first, 0) {
        rest = element(rest, "responderID")?.0;
    }
    let (rest, _) = parse::<GeneralizedTime>(rest, "producedAt")?;
    let (_, mut responses) = universal(rest, Tag::Sequence, "responses")?;

    while !responses.is_empty() {
        let (next, single) = universal(responses, Tag::Sequence, "SingleResponse")?;
        responses = next;
        let (rest, cert_id) = universal(single, Tag::Sequence, "certID")?;
        let (cert_id, _) = universal(cert_id, Tag::Sequence, "hashAlgorithm")?;
        let (cert_id, _) = parse::<OctetString>(cert_id, "issuerNameHash")?;
        let (cert_id, _) = parse::<OctetString>(cert_id, "issuerKeyHash")?;
        let (_, number) = parse::<Integer>(cert_id, "serialNumber")?;
        if number.as_ref() != serial {
            continue;
        }

        let (rest, cert_status) = element(rest, "certStatus")?;
        let status = match (cert_status.class(), cert_status.tag().0) {
            (Class::ContextSpecific, 0) => CertStatus::Good,
            (Class::ContextSpecific, 2) => CertStatus::Unknown,
            (Class::ContextSpecific, 1) => {
                let (info, revoked_at) = parse::<GeneralizedTime>(cert_status.data, "revocationTime")?;
                let reason = if info.is_empty() {
                    None
                } else {
                    let (_, reason) = context(info, 0, "revocationReason")?;
                    Some(parse::<Enumerated>(reason, "revocationReason")?.1 .0)
                };
                CertStatus::Revoked {
                    revoked_at: utc(&revoked_at)?,
                    reason,
                }
            }
            _ => return Err(OcspError::Malformed("certStatus")),
        };

        let (rest, this_update) = parse::<GeneralizedTime>(rest, "thisUpdate")?;
        let next_update = match element(rest, "nextUpdate") {
            Ok((_, field)) if is_context(&field, 0) => {
                Some(utc(&parse::<GeneralizedTime>(field.data, "nextUpdate")?.1)?)
            }
            _ => None,
        };

        return Ok(OcspStatus {
            status,
            this_update: utc(&this_update)?,
            next_update,
        });
    }

    Err(OcspError::NotInResponse)
}

/// Ask the certificate's responder, or `url` when given, for its status.
pub async fn query_status(
    http: &Client,
    leaf_der: &[u8],
    issuer_der: &[u8],
    url: Option<&str>,
) -> Result<OcspStatus, OcspError> {
    let url = match url {
        Some(url) => url.to_string(),
        None => responder_url(leaf_der)?,
    };
    let request = build_request(leaf_der, issuer_der)?;
    let serial = parse_cert(leaf_der)?.1.raw_serial().to_vec();

    debug!(url = %url, "Sending OCSP request");
    let body = http
        .post(&url)
        .header(CONTENT_TYPE, "application/ocsp-request")
        .body(request)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    parse_response(&body, &serial)
}

fn parse_cert(der: &[u8]) -> Result<(&[u8], X509Certificate<'_>), OcspError> {
    X509Certificate::from_der(der).map_err(|e| OcspError::Certificate(e.to_string()))
}

// ============================================================================
// DER helpers over asn1-rs
// ============================================================================

fn encode<T: ToDer>(value: &T) -> Result<Vec<u8>, OcspError> {
    value
        .to_der_vec()
        .map_err(|e| OcspError::Encoding(e.to_string()))
}

fn sequence(parts: &[Vec<u8>]) -> Result<Vec<u8>, OcspError> {
    encode(&Sequence::new(parts.concat().into()))
}

fn parse<'a, T: FromDer<'a>>(
    input: &'a [u8],
    what: &'static str,
) -> Result<(&'a [u8], T), OcspError> {
    T::from_der(input).map_err(|e| {
        debug!(field = what, error = %e, "Invalid OCSP field");
        OcspError::Malformed(what)
    })
}

fn element<'a>(input: &'a [u8], what: &'static str) -> Result<(&'a [u8], Any<'a>), OcspError> {
    parse::<Any>(input, what)
}

fn is_context(any: &Any<'_>, tag: u32) -> bool {
    any.class() == Class::ContextSpecific && any.tag() == Tag(tag)
}

/// Content of the next element, which must be the universal `tag`.
fn universal<'a>(
    input: &'a [u8],
    tag: Tag,
    what: &'static str,
) -> Result<(&'a [u8], &'a [u8]), OcspError> {
    match element(input, what)? {
        (rest, any) if any.class() == Class::Universal && any.tag() == tag => Ok((rest, any.data)),
        _ => Err(OcspError::Malformed(what)),
    }
}

/// Content of the next element, which must be the context-specific `[tag]`.
fn context<'a>(input: &'a [u8], tag: u32, what: &'static str) -> Result<(&'a [u8], &'a [u8]), OcspError> {
    match element(input, what)? {
        (rest, any) if is_context(&any, tag) => Ok((rest, any.data)),
        _ => Err(OcspError::Malformed(what)),
    }
}

/// DER GeneralizedTime always ends in `Z`; fractional seconds are dropped.
fn utc(time: &GeneralizedTime) -> Result<DateTime<Utc>, OcspError> {
    let t = &time.0;
    Utc.with_ymd_and_hms(
        t.year as i32,
        t.month.into(),
        t.day.into(),
        t.hour.into(),
        t.minute.into(),
        t.second.into(),
    )
    .single()
    .ok_or(OcspError::Malformed("time out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, CustomExtension, IsCa, KeyPair};
    use x509_parser::asn1_rs::{Header, Length};
    use x509_parser::oid_registry::OID_SIG_ECDSA_WITH_SHA256;

    fn der<T: ToDer>(value: T) -> Vec<u8> {
        value.to_der_vec().unwrap()
    }

    fn seq(parts: &[Vec<u8>]) -> Vec<u8> {
        sequence(parts).unwrap()
    }

    fn tagged(tag: u32, constructed: bool, content: &[u8]) -> Vec<u8> {
        let header = Header::new(
            Class::ContextSpecific,
            constructed,
            Tag(tag),
            Length::Definite(content.len()),
        );
        der(Any::new(header, content))
    }

    fn time(s: &str) -> Vec<u8> {
        der(Any::from_tag_and_data(Tag::GeneralizedTime, s.as_bytes()))
    }

    fn octets(data: &[u8]) -> Vec<u8> {
        der(OctetString::new(data))
    }

    fn basic_oid() -> Vec<u8> {
        der(Oid::from(&[1, 3, 6, 1, 5, 5, 7, 48, 1, 1]).unwrap())
    }

    fn single(serial: &[u8], status: Vec<u8>, next_update: bool) -> Vec<u8> {
        let cert_id = seq(&[
            seq(&[der(OID_HASH_SHA1), der(Null::new())]),
            octets(&[0u8; 20]),
            octets(&[0u8; 20]),
            der(Integer::new(serial)),
        ]);
        let mut fields = vec![cert_id, status, time("20240101000000Z")];
        if next_update {
            fields.push(tagged(0, true, &time("20240108000000Z")));
        }
        seq(&fields)
    }

    /// A successful basic response listing another certificate first.
    fn response_with(responder_id: &[u8], target: Vec<u8>) -> Vec<u8> {
        let other = single(&[0x7f], tagged(2, false, &[]), false);
        let data = seq(&[
            tagged(2, true, &octets(responder_id)),
            time("20240101000000Z"),
            seq(&[other, target]),
        ]);
        let basic = seq(&[
            data,
            seq(&[der(OID_SIG_ECDSA_WITH_SHA256)]),
            der(Any::from_tag_and_data(Tag::BitString, &[0, 1, 2, 3])),
        ]);
        let response_bytes = seq(&[basic_oid(), octets(&basic)]);
        seq(&[der(Enumerated::new(0)), tagged(0, true, &response_bytes)])
    }

    fn response(serial: &[u8], status: Vec<u8>, next_update: bool) -> Vec<u8> {
        response_with(&[9u8; 20], single(serial, status, next_update))
    }

    #[test]
    fn test_good_response() {
        let der = response(&[0x01, 0x02], tagged(0, false, &[]), true);
        let status = parse_response(&der, &[0x01, 0x02]).unwrap();
        assert_eq!(status.status, CertStatus::Good);
        assert_eq!(status.this_update.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(
            status.next_update.map(|t| t.to_rfc3339()),
            Some("2024-01-08T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_revoked_response() {
        let revoked = tagged(
            1,
            true,
            &[
                time("20240102030405.123Z"),
                tagged(0, true, &der(Enumerated::new(1))),
            ]
            .concat(),
        );
        let der = response(&[0x05], revoked, false);
        let status = parse_response(&der, &[0x05]).unwrap();
        match status.status {
            CertStatus::Revoked { revoked_at, reason } => {
                assert_eq!(revoked_at.to_rfc3339(), "2024-01-02T03:04:05+00:00");
                assert_eq!(reason, Some(1));
            }
            other => panic!("expected revoked, got {other:?}"),
        }
        assert!(status.next_update.is_none());
    }

    #[test]
    fn test_unknown_and_missing_serial() {
        let der = response(&[0x05], tagged(2, false, &[]), false);
        assert_eq!(parse_response(&der, &[0x05]).unwrap().status, CertStatus::Unknown);
        assert!(matches!(
            parse_response(&der, &[0x06]),
            Err(OcspError::NotInResponse)
        ));
    }

    #[test]
    fn test_unsuccessful_response() {
        let der = seq(&[der(Enumerated::new(3))]);
        let err = parse_response(&der, &[1]).unwrap_err();
        assert!(matches!(err, OcspError::Unsuccessful(3)));
        assert!(err.to_string().contains("tryLater"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_response(&[0x30, 0x05, 0x0a], &[1]),
            Err(OcspError::Malformed(_))
        ));
        assert!(matches!(parse_response(&[], &[1]), Err(OcspError::Malformed(_))));
    }

    #[test]
    fn test_long_fields() {
        // A responder key hash this long needs a multi-byte length.
        let der = response_with(&[7u8; 300], single(&[0x05], tagged(0, false, &[]), false));
        assert_eq!(parse_response(&der, &[0x05]).unwrap().status, CertStatus::Good);
    }

    fn ca_and_leaf(with_aia: bool) -> (Vec<u8>, Vec<u8>) {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        if with_aia {
            // AuthorityInfoAccess with one OCSP access description.
            let desc = seq(&[
                der(OID_PKIX_ACCESS_DESCRIPTOR_OCSP),
                tagged(6, false, b"http://ocsp.test/"),
            ]);
            leaf_params.custom_extensions.push(CustomExtension::from_oid_content(
                &[1, 3, 6, 1, 5, 5, 7, 1, 1],
                seq(&[desc]),
            ));
        }
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();
        (leaf.der().to_vec(), ca.der().to_vec())
    }

    #[test]
    fn test_build_request() {
        let (leaf, ca) = ca_and_leaf(false);
        let request = build_request(&leaf, &ca).unwrap();

        let (_, tbs) = universal(&request, Tag::Sequence, "OCSPRequest").unwrap();
        let (_, list) = universal(tbs, Tag::Sequence, "tbsRequest").unwrap();
        let (_, req) = universal(list, Tag::Sequence, "requestList").unwrap();
        let (_, req) = universal(req, Tag::Sequence, "Request").unwrap();
        let (_, cert_id) = universal(req, Tag::Sequence, "reqCert").unwrap();

        let (cert_id, alg) = universal(cert_id, Tag::Sequence, "hashAlgorithm").unwrap();
        let (_, oid) = parse::<Oid>(alg, "algorithm").unwrap();
        assert_eq!(oid, OID_HASH_SHA1);
        let (cert_id, name_hash) = parse::<OctetString>(cert_id, "issuerNameHash").unwrap();
        assert_eq!(name_hash.as_ref().len(), 20);
        let (cert_id, key_hash) = parse::<OctetString>(cert_id, "issuerKeyHash").unwrap();
        assert_eq!(key_hash.as_ref().len(), 20);

        let (_, serial) = parse::<Integer>(cert_id, "serialNumber").unwrap();
        let (_, parsed) = X509Certificate::from_der(&leaf).unwrap();
        assert_eq!(serial.as_ref(), parsed.raw_serial());
    }

    #[test]
    fn test_responder_url() {
        let (leaf, _) = ca_and_leaf(true);
        assert_eq!(responder_url(&leaf).unwrap(), "http://ocsp.test/");

        let (leaf, _) = ca_and_leaf(false);
        assert!(matches!(responder_url(&leaf), Err(OcspError::NoResponder)));
    }
}
