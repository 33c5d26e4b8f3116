use time::{Duration, OffsetDateTime};

use crate::crd::CertificateSpec;

/// How long before expiry a certificate with the given lifetime should be renewed.
///
/// `renewBefore` wins if it is shorter than the lifetime, then `renewBeforePercentage`,
/// falling back to a third of the lifetime.
pub fn renew_before(actual_duration: Duration, spec: &CertificateSpec) -> Duration {
    if let Some(renew_before) = spec
        .renew_before
        .and_then(|renew_before| Duration::try_from(*renew_before).ok())
        .filter(|renew_before| renew_before.is_positive() && *renew_before < actual_duration)
    {
        return renew_before;
    }
    if let Some(percentage) = spec.renew_before_percentage {
        return actual_duration * percentage / 100;
    }
    actual_duration / 3
}

/// When a certificate valid from `not_before` until `not_after` is due for renewal,
/// truncated to whole seconds.
pub fn renewal_time(
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    spec: &CertificateSpec,
) -> OffsetDateTime {
    let renewal = not_after - renew_before(not_after - not_before, spec);
    renewal.replace_nanosecond(0).unwrap_or(renewal)
}
