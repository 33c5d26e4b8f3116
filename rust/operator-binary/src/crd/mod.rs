//! CRDs owned by [cert-manager](https://cert-manager.io/), see [their API docs](https://cert-manager.io/docs/reference/api-docs/).
//!
//! Only the fields that influence whether a Secret is up to date are modelled.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_certificate_policy_pki::x509;
use stackable_operator::{
    k8s_openapi::ByteString,
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

mod duration;

pub use duration::{GoDuration, ParseDurationError};

pub const GROUP: &str = "cert-manager.io";
pub const DEFAULT_ISSUER_KIND: &str = "Issuer";

/// Applied to every Secret written by cert-manager, used to split the Secret caches.
pub const PART_OF_CERT_MANAGER_LABEL: &str = "controller.cert-manager.io/fao";

pub const CERTIFICATE_NAME_ANNOTATION: &str = "cert-manager.io/certificate-name";
pub const ISSUER_NAME_ANNOTATION: &str = "cert-manager.io/issuer-name";
pub const ISSUER_KIND_ANNOTATION: &str = "cert-manager.io/issuer-kind";
pub const ISSUER_GROUP_ANNOTATION: &str = "cert-manager.io/issuer-group";
pub const COMMON_NAME_ANNOTATION: &str = "cert-manager.io/common-name";
pub const ALT_NAMES_ANNOTATION: &str = "cert-manager.io/alt-names";
pub const IP_SANS_ANNOTATION: &str = "cert-manager.io/ip-sans";
pub const URI_SANS_ANNOTATION: &str = "cert-manager.io/uri-sans";
pub const EMAIL_SANS_ANNOTATION: &str = "cert-manager.io/email-sans";
pub const SUBJECT_ORGANIZATIONS_ANNOTATION: &str = "cert-manager.io/subject-organizations";
pub const SUBJECT_ORGANIZATIONAL_UNITS_ANNOTATION: &str =
    "cert-manager.io/subject-organizationalunits";
pub const SUBJECT_COUNTRIES_ANNOTATION: &str = "cert-manager.io/subject-countries";
pub const SUBJECT_PROVINCES_ANNOTATION: &str = "cert-manager.io/subject-provinces";
pub const SUBJECT_LOCALITIES_ANNOTATION: &str = "cert-manager.io/subject-localities";
pub const SUBJECT_POSTAL_CODES_ANNOTATION: &str = "cert-manager.io/subject-postalcodes";
pub const SUBJECT_STREET_ADDRESSES_ANNOTATION: &str = "cert-manager.io/subject-streetaddresses";
pub const SUBJECT_SERIAL_NUMBER_ANNOTATION: &str = "cert-manager.io/subject-serialnumber";
/// Set on CertificateRequests, counts the issuances of the owning Certificate.
pub const CERTIFICATE_REVISION_ANNOTATION: &str = "cert-manager.io/certificate-revision";

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const COMBINED_PEM_KEY: &str = "tls-combined.pem";
pub const DER_KEY: &str = "key.der";
pub const JKS_KEYSTORE_KEY: &str = "keystore.jks";
pub const JKS_TRUSTSTORE_KEY: &str = "truststore.jks";
pub const PKCS12_KEYSTORE_KEY: &str = "keystore.p12";
pub const PKCS12_TRUSTSTORE_KEY: &str = "truststore.p12";

/// Used when `spec.duration` is unset.
pub const DEFAULT_DURATION: GoDuration = GoDuration::from_hours(90 * 24);

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.Certificate>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// An RFC 4514 subject that is used verbatim, mutually exclusive with `subject` and `commonName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal_subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<X509Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub email_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_names: Vec<OtherName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<GoDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<GoDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_before_percentage: Option<u32>,
    pub issuer_ref: ObjectReference,
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_template: Option<SecretTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_output_formats: Vec<AdditionalOutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystores: Option<Keystores>,
}

impl CertificateSpec {
    pub fn duration(&self) -> GoDuration {
        self.duration.unwrap_or(DEFAULT_DURATION)
    }

    /// The requested usages, falling back to cert-manager's defaults.
    pub fn usages(&self) -> Vec<KeyUsage> {
        usages_or_default(&self.usages)
    }

    pub fn private_key(&self) -> CertificatePrivateKey {
        self.private_key.clone().unwrap_or_default()
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateStatus>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_private_key_secret_name: Option<String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.X509Subject>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct X509Subject {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizational_units: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub localities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provinces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub street_addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub postal_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.OtherName>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OtherName {
    pub oid: String,
    pub utf8_value: String,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#meta.cert-manager.io/v1.ObjectReference>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl ObjectReference {
    pub fn kind(&self) -> &str {
        self.kind
            .as_deref()
            .filter(|kind| !kind.is_empty())
            .unwrap_or(DEFAULT_ISSUER_KIND)
    }

    pub fn group(&self) -> &str {
        self.group
            .as_deref()
            .filter(|group| !group.is_empty())
            .unwrap_or(GROUP)
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificatePrivateKey>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<PrivateKeyAlgorithm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<PrivateKeyEncoding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_policy: Option<PrivateKeyRotationPolicy>,
}

impl CertificatePrivateKey {
    pub fn algorithm(&self) -> PrivateKeyAlgorithm {
        self.algorithm.unwrap_or_default()
    }

    pub fn encoding(&self) -> PrivateKeyEncoding {
        self.encoding.unwrap_or_default()
    }

    /// The key size, or the algorithm's default when unset. Ed25519 keys have no size.
    pub fn size(&self) -> u32 {
        match (self.algorithm(), self.size) {
            (PrivateKeyAlgorithm::Ed25519, _) => 0,
            (_, Some(size)) if size != 0 => size,
            (PrivateKeyAlgorithm::Rsa, _) => 2048,
            (PrivateKeyAlgorithm::Ecdsa, _) => 256,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PrivateKeyAlgorithm {
    #[default]
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "ECDSA")]
    Ecdsa,
    Ed25519,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PrivateKeyEncoding {
    #[default]
    #[serde(rename = "PKCS1")]
    Pkcs1,
    #[serde(rename = "PKCS8")]
    Pkcs8,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum PrivateKeyRotationPolicy {
    Never,
    #[default]
    Always,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateSecretTemplate>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateAdditionalOutputFormat>.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalOutputFormat {
    #[serde(rename = "type")]
    pub format: AdditionalOutputFormatType,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AdditionalOutputFormatType {
    /// The private key and certificate chain in a single PEM file, stored as `tls-combined.pem`.
    #[serde(rename = "CombinedPEM")]
    CombinedPem,
    /// The private key in DER encoding, stored as `key.der`.
    #[serde(rename = "DER")]
    Der,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateKeystores>.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Keystores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jks: Option<Keystore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs12: Option<Keystore>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Keystore {
    pub create: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret_ref: Option<SecretKeySelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.KeyUsage>.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
pub enum KeyUsage {
    #[serde(rename = "signing")]
    Signing,
    #[serde(rename = "digital signature")]
    DigitalSignature,
    #[serde(rename = "content commitment")]
    ContentCommitment,
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
    #[serde(rename = "key agreement")]
    KeyAgreement,
    #[serde(rename = "data encipherment")]
    DataEncipherment,
    #[serde(rename = "cert sign")]
    CertSign,
    #[serde(rename = "crl sign")]
    CrlSign,
    #[serde(rename = "encipher only")]
    EncipherOnly,
    #[serde(rename = "decipher only")]
    DecipherOnly,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "server auth")]
    ServerAuth,
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "code signing")]
    CodeSigning,
    #[serde(rename = "email protection")]
    EmailProtection,
    #[serde(rename = "s/mime")]
    SMime,
    #[serde(rename = "ipsec end system")]
    IpsecEndSystem,
    #[serde(rename = "ipsec tunnel")]
    IpsecTunnel,
    #[serde(rename = "ipsec user")]
    IpsecUser,
    #[serde(rename = "timestamping")]
    Timestamping,
    #[serde(rename = "ocsp signing")]
    OcspSigning,
    #[serde(rename = "microsoft sgc")]
    MicrosoftSgc,
    #[serde(rename = "netscape sgc")]
    NetscapeSgc,
}

impl KeyUsage {
    /// The bit this usage sets in the `keyUsage` extension, if it is a basic usage.
    pub fn key_usage(self) -> Option<x509::KeyUsage> {
        Some(match self {
            KeyUsage::Signing | KeyUsage::DigitalSignature => x509::KeyUsage::DIGITAL_SIGNATURE,
            KeyUsage::ContentCommitment => x509::KeyUsage::CONTENT_COMMITMENT,
            KeyUsage::KeyEncipherment => x509::KeyUsage::KEY_ENCIPHERMENT,
            KeyUsage::KeyAgreement => x509::KeyUsage::KEY_AGREEMENT,
            KeyUsage::DataEncipherment => x509::KeyUsage::DATA_ENCIPHERMENT,
            KeyUsage::CertSign => x509::KeyUsage::KEY_CERT_SIGN,
            KeyUsage::CrlSign => x509::KeyUsage::CRL_SIGN,
            KeyUsage::EncipherOnly => x509::KeyUsage::ENCIPHER_ONLY,
            KeyUsage::DecipherOnly => x509::KeyUsage::DECIPHER_ONLY,
            _ => return None,
        })
    }

    /// The OID this usage adds to the `extKeyUsage` extension, if it is an extended usage.
    pub fn ext_key_usage(self) -> Option<&'static [u64]> {
        Some(match self {
            KeyUsage::Any => &[2, 5, 29, 37, 0],
            KeyUsage::ServerAuth => &[1, 3, 6, 1, 5, 5, 7, 3, 1],
            KeyUsage::ClientAuth => &[1, 3, 6, 1, 5, 5, 7, 3, 2],
            KeyUsage::CodeSigning => &[1, 3, 6, 1, 5, 5, 7, 3, 3],
            KeyUsage::EmailProtection | KeyUsage::SMime => &[1, 3, 6, 1, 5, 5, 7, 3, 4],
            KeyUsage::IpsecEndSystem => &[1, 3, 6, 1, 5, 5, 7, 3, 5],
            KeyUsage::IpsecTunnel => &[1, 3, 6, 1, 5, 5, 7, 3, 6],
            KeyUsage::IpsecUser => &[1, 3, 6, 1, 5, 5, 7, 3, 7],
            KeyUsage::Timestamping => &[1, 3, 6, 1, 5, 5, 7, 3, 8],
            KeyUsage::OcspSigning => &[1, 3, 6, 1, 5, 5, 7, 3, 9],
            KeyUsage::MicrosoftSgc => &[1, 3, 6, 1, 4, 1, 311, 10, 3, 3],
            KeyUsage::NetscapeSgc => &[2, 16, 840, 1, 113730, 4, 1],
            _ => return None,
        })
    }
}

/// See <https://cert-manager.io/docs/reference/api-docs/#cert-manager.io/v1.CertificateRequest>.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 certificate signing request.
    pub request: ByteString,
    pub issuer_ref: ObjectReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<GoDuration>,
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,
}

impl CertificateRequestSpec {
    pub fn usages(&self) -> Vec<KeyUsage> {
        usages_or_default(&self.usages)
    }
}

fn usages_or_default(usages: &[KeyUsage]) -> Vec<KeyUsage> {
    if usages.is_empty() {
        vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment]
    } else {
        usages.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_certificate() {
        let certificate: Certificate = serde_yaml::from_str(
            "
            apiVersion: cert-manager.io/v1
            kind: Certificate
            metadata:
              name: example
              namespace: default
            spec:
              secretName: example-tls
              commonName: example.com
              dnsNames:
                - example.com
                - www.example.com
              duration: 2160h0m0s
              renewBefore: 360h
              isCA: false
              usages:
                - server auth
                - digital signature
              issuerRef:
                name: ca-issuer
                kind: ClusterIssuer
              privateKey:
                algorithm: ECDSA
                size: 384
                rotationPolicy: Always
              secretTemplate:
                labels:
                  app: example
              additionalOutputFormats:
                - type: CombinedPEM
                - type: DER
              keystores:
                pkcs12:
                  create: true
                  passwordSecretRef:
                    name: pkcs12-password
                    key: password
            status:
              revision: 3
            ",
        )
        .unwrap();

        let spec = &certificate.spec;
        assert_eq!(spec.secret_name, "example-tls");
        assert_eq!(spec.duration(), DEFAULT_DURATION);
        assert_eq!(spec.renew_before, Some(GoDuration::from_hours(360)));
        assert_eq!(spec.usages, vec![KeyUsage::ServerAuth, KeyUsage::DigitalSignature]);
        assert_eq!(spec.issuer_ref.kind(), "ClusterIssuer");
        assert_eq!(spec.issuer_ref.group(), GROUP);
        assert_eq!(spec.private_key().algorithm(), PrivateKeyAlgorithm::Ecdsa);
        assert_eq!(spec.private_key().size(), 384);
        assert_eq!(spec.private_key().encoding(), PrivateKeyEncoding::Pkcs1);
        assert_eq!(
            spec.additional_output_formats
                .iter()
                .map(|format| format.format)
                .collect::<Vec<_>>(),
            vec![
                AdditionalOutputFormatType::CombinedPem,
                AdditionalOutputFormatType::Der
            ]
        );
        assert!(spec.keystores.as_ref().unwrap().pkcs12.as_ref().unwrap().create);
        assert_eq!(certificate.status.unwrap().revision, Some(3));
    }

    #[test]
    fn test_defaults() {
        let spec: CertificateSpec = serde_yaml::from_str(
            "
            secretName: minimal
            issuerRef:
              name: selfsigned
            ",
        )
        .unwrap();
        assert_eq!(spec.duration(), GoDuration::from_hours(2160));
        assert_eq!(
            spec.usages(),
            vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment]
        );
        assert_eq!(spec.issuer_ref.kind(), DEFAULT_ISSUER_KIND);
        assert_eq!(spec.private_key().algorithm(), PrivateKeyAlgorithm::Rsa);
        assert_eq!(spec.private_key().size(), 2048);
    }

    #[test]
    fn test_invalid_duration_is_rejected() {
        assert!(serde_yaml::from_str::<CertificateSpec>(
            "
            secretName: broken
            duration: 90 days
            issuerRef:
              name: selfsigned
            ",
        )
        .is_err());
    }

    #[test]
    fn test_key_usage_mapping() {
        assert_eq!(
            KeyUsage::Signing.key_usage(),
            Some(x509::KeyUsage::DIGITAL_SIGNATURE)
        );
        assert_eq!(KeyUsage::ServerAuth.key_usage(), None);
        assert_eq!(
            KeyUsage::ServerAuth.ext_key_usage(),
            Some([1, 3, 6, 1, 5, 5, 7, 3, 1].as_slice())
        );
        assert_eq!(KeyUsage::CertSign.ext_key_usage(), None);
    }

    #[test]
    fn test_deserialize_certificate_request() {
        let request: CertificateRequest = serde_yaml::from_str(
            "
            apiVersion: cert-manager.io/v1
            kind: CertificateRequest
            metadata:
              name: example-1
              namespace: default
            spec:
              request: LS0tLS1CRUdJTg==
              issuerRef:
                name: ca-issuer
              duration: 1h
              usages:
                - client auth
            ",
        )
        .unwrap();
        assert_eq!(request.spec.request.0, b"-----BEGIN");
        assert_eq!(request.spec.duration, Some(GoDuration::from_hours(1)));
    }
}
