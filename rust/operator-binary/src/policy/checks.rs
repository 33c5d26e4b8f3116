use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::{format_list, matching, renewal_time, Check, Context, PolicyViolation, Reason};
use crate::{
    crd::{
        CERTIFICATE_NAME_ANNOTATION, GROUP, ISSUER_GROUP_ANNOTATION, ISSUER_KIND_ANNOTATION,
        ISSUER_NAME_ANNOTATION, DEFAULT_ISSUER_KIND,
    },
    metadata::{self, ExpectedMetadata, MismatchKind},
    utils::error_chain_message,
};

pub const SECRET_STATE: Check = Check {
    name: "SecretState",
    evaluate: secret_state,
};
pub const CERTIFICATE_REQUEST: Check = Check {
    name: "CertificateRequest",
    evaluate: certificate_request,
};
pub const MANAGED_FIELDS: Check = Check {
    name: "ManagedFields",
    evaluate: managed_fields,
};
pub const ISSUER: Check = Check {
    name: "IssuerAnnotations",
    evaluate: issuer,
};
pub const CERTIFICATE_NAME: Check = Check {
    name: "CertificateNameAnnotation",
    evaluate: certificate_name,
};
pub const PRIVATE_KEY: Check = Check {
    name: "PrivateKey",
    evaluate: private_key,
};
pub const CERTIFICATE_CONTENT: Check = Check {
    name: "CertificateContent",
    evaluate: certificate_content,
};
pub const REQUEST_CHANGED: Check = Check {
    name: "RequestChanged",
    evaluate: request_changed,
};
pub const EXPIRED: Check = Check {
    name: "Expired",
    evaluate: expired,
};
pub const RENEWING: Check = Check {
    name: "Renewing",
    evaluate: renewing,
};
pub const SECRET_METADATA: Check = Check {
    name: "SecretMetadata",
    evaluate: secret_metadata,
};
pub const ADDITIONAL_OUTPUT_FORMATS: Check = Check {
    name: "AdditionalOutputFormats",
    evaluate: additional_output_formats,
};
pub const OWNER_REFERENCE: Check = Check {
    name: "OwnerReference",
    evaluate: owner_reference,
};
pub const KEYSTORES: Check = Check {
    name: "Keystores",
    evaluate: keystores,
};

fn secret_state(ctx: &Context) -> Option<PolicyViolation> {
    let err = ctx.secret_state.as_ref().err()?;
    Some(PolicyViolation::new(err.reason(), error_chain_message(err)))
}

fn certificate_request(ctx: &Context) -> Option<PolicyViolation> {
    let (_, state) = ctx.request.as_ref()?;
    let err = state.as_ref().err()?;
    Some(PolicyViolation::new(
        Reason::InvalidCertificateRequest,
        format!(
            "Failed to decode the current CertificateRequest: {}",
            error_chain_message(err)
        ),
    ))
}

fn managed_fields(ctx: &Context) -> Option<PolicyViolation> {
    let err = ctx.managed_fields.as_ref()?.as_ref().err()?;
    Some(PolicyViolation::new(
        Reason::InvalidManagedFields,
        error_chain_message(err),
    ))
}

fn issuer(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, _) = ctx.valid_secret()?;
    let annotations = secret.metadata.annotations.clone().unwrap_or_default();
    let annotation = |key: &str, default: &'static str| {
        annotations
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .unwrap_or(default)
            .to_string()
    };
    let name = annotation(ISSUER_NAME_ANNOTATION, "");
    let kind = annotation(ISSUER_KIND_ANNOTATION, DEFAULT_ISSUER_KIND);
    let group = annotation(ISSUER_GROUP_ANNOTATION, GROUP);

    let issuer_ref = &ctx.certificate.spec.issuer_ref;
    if name == issuer_ref.name && kind == issuer_ref.kind() && group == issuer_ref.group() {
        return None;
    }
    Some(PolicyViolation::new(
        Reason::IncorrectIssuer,
        format!(
            "Issuer of the certificate is not up to date: {kind}.{group}/{name:?}, expected {}.{}/{:?}",
            issuer_ref.kind(),
            issuer_ref.group(),
            issuer_ref.name
        ),
    ))
}

fn certificate_name(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, _) = ctx.valid_secret()?;
    let issued_for = secret
        .metadata
        .annotations
        .as_ref()?
        .get(CERTIFICATE_NAME_ANNOTATION)
        .filter(|name| !name.is_empty())?;
    if Some(issued_for) == ctx.certificate.metadata.name.as_ref() {
        return None;
    }
    Some(PolicyViolation::new(
        Reason::IncorrectCertificate,
        format!(
            "Secret was issued for {issued_for:?}. If this message is not transient, you might \
             have two conflicting Certificates pointing to the same secret."
        ),
    ))
}

fn private_key(ctx: &Context) -> Option<PolicyViolation> {
    let (_, state) = ctx.valid_secret()?;
    let mismatches = matching::private_key_mismatches(&ctx.certificate.spec, &state.private_key);
    (!mismatches.is_empty()).then(|| {
        PolicyViolation::new(
            Reason::SecretMismatch,
            format!(
                "Existing private key is not up to date for spec: {}",
                format_list(mismatches)
            ),
        )
    })
}

/// Compares the issued certificate against the Certificate spec, unless a CertificateRequest
/// exists, in which case the stricter [`request_changed`] applies.
fn certificate_content(ctx: &Context) -> Option<PolicyViolation> {
    if ctx.request.is_some() {
        return None;
    }
    let (_, state) = ctx.valid_secret()?;
    let mismatches = matching::certificate_mismatches(&ctx.certificate.spec, &state.details);
    (!mismatches.is_empty()).then(|| {
        PolicyViolation::new(
            Reason::SecretMismatch,
            format!(
                "Issuing certificate as Secret was previously issued for a different spec: {}",
                format_list(mismatches)
            ),
        )
    })
}

fn request_changed(ctx: &Context) -> Option<PolicyViolation> {
    let (request, state) = ctx.request.as_ref()?;
    let state = state.as_ref().ok()?;
    let mismatches =
        matching::request_mismatches(&ctx.certificate.spec, request, &state.details);
    (!mismatches.is_empty()).then(|| {
        PolicyViolation::new(
            Reason::RequestChanged,
            format!(
                "Fields on existing CertificateRequest resource not up to date: {}",
                format_list(mismatches)
            ),
        )
    })
}

fn expired(ctx: &Context) -> Option<PolicyViolation> {
    let (_, state) = ctx.valid_secret()?;
    (ctx.now >= state.not_after).then(|| {
        PolicyViolation::new(
            Reason::Expired,
            format!("Certificate expired on {}", rfc3339(state.not_after)),
        )
    })
}

fn renewing(ctx: &Context) -> Option<PolicyViolation> {
    let (_, state) = ctx.valid_secret()?;
    let renewal = renewal_time(state.not_before, state.not_after, &ctx.certificate.spec);
    (ctx.now >= renewal).then(|| {
        PolicyViolation::new(
            Reason::Renewing,
            format!(
                "Renewing certificate as renewal was scheduled at {}",
                rfc3339(renewal)
            ),
        )
    })
}

fn secret_metadata(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, state) = ctx.valid_secret()?;
    let managed = ctx.managed()?;
    let expected = ExpectedMetadata::new(ctx.certificate, &state.details);
    let mismatches = metadata::diff_metadata(&expected, secret, managed);
    (!mismatches.is_empty()).then(|| {
        PolicyViolation::new(
            Reason::SecretMetadataMismatch,
            format!(
                "Secret metadata does not match the Certificate: {}",
                format_list(mismatches)
            ),
        )
    })
}

fn additional_output_formats(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, state) = ctx.valid_secret()?;
    let managed = ctx.managed()?;
    let message = match metadata::diff_additional_output_formats(
        ctx.certificate,
        secret,
        &state.private_key_pem,
        &state.certificate_pem,
        managed,
    ) {
        Ok(mismatches) if mismatches.is_empty() => return None,
        Ok(mismatches) => format!(
            "Secret's additional output formats do not match the Certificate: {}",
            format_list(mismatches)
        ),
        Err(err) => format!(
            "failed to compute additional output formats: {}",
            error_chain_message(&err)
        ),
    };
    Some(PolicyViolation::new(
        Reason::AdditionalOutputFormatsMismatch,
        message,
    ))
}

fn owner_reference(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, _) = ctx.valid_secret()?;
    let managed = ctx.managed()?;
    let enabled = ctx.options.owner_references_enabled;
    let message = match metadata::diff_owner_reference(ctx.certificate, secret, enabled, managed)? {
        MismatchKind::Missing => "Secret is missing the owner reference to its Certificate",
        MismatchKind::Incorrect => "Secret has an outdated owner reference to its Certificate",
        MismatchKind::Unexpected => {
            "Secret has an owner reference to its Certificate, but owner references are disabled"
        }
    };
    Some(PolicyViolation::new(Reason::SecretOwnerRefMismatch, message))
}

fn keystores(ctx: &Context) -> Option<PolicyViolation> {
    let (secret, state) = ctx.valid_secret()?;
    let managed = ctx.managed()?;
    let mismatches =
        metadata::diff_keystores(ctx.certificate, secret, state.ca.is_some(), managed);
    (!mismatches.is_empty()).then(|| {
        PolicyViolation::new(
            Reason::SecretKeystoreMismatch,
            format!(
                "Secret's keystores do not match the Certificate: {}",
                format_list(mismatches)
            ),
        )
    })
}

fn rfc3339(time: OffsetDateTime) -> String {
    time.format(&Rfc3339).unwrap_or_else(|_| time.to_string())
}
