//! Certificates
//!
//! Servers started without a configured certificate get an ephemeral
//! self-signed one for `localhost`, generated at startup.

use super::config::TlsError;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509Ref, X509};

/// Validity of generated certificates
const SELF_SIGNED_DAYS: u32 = 365;

/// Generate a self-signed certificate and its RSA key
///
/// The certificate carries `common_name` as subject and issuer, plus
/// `localhost` and `127.0.0.1` as subject alternative names.
pub fn self_signed(common_name: &str) -> Result<(X509, PKey<Private>), TlsError> {
    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(SELF_SIGNED_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;

    let san = SubjectAlternativeName::new()
        .dns(common_name)
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;

    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Subject Alternative Names (DNS names and IPv4 addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509_ref(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: subject_alt_names(cert),
        }
    }
}

fn common_name(name: &openssl::x509::X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<undef>".to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                if ip.len() == 4 {
                    names.push(format!("IP:{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]));
                }
            }
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_certificate() {
        let (cert, key) = self_signed("protonnet.test").unwrap();
        let info = CertInfo::from_x509_ref(&cert);

        assert_eq!(info.subject, "protonnet.test");
        assert_eq!(info.issuer, "protonnet.test");
        assert!(info.subject_alt_names.contains(&"DNS:localhost".to_string()));
        assert!(info.subject_alt_names.contains(&"IP:127.0.0.1".to_string()));

        // Signed with its own key
        let public = cert.public_key().unwrap();
        assert!(public.public_eq(&key));
        assert!(cert.verify(&public).unwrap());
    }
}
