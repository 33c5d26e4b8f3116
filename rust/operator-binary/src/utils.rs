//! Conversions between OpenSSL's certificate types and the rest of the crate.

use openssl::{
    asn1::{Asn1Time, Asn1TimeRef, TimeDiff},
    x509::X509Ref,
};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use time::OffsetDateTime;

/// Renders an error and its sources as `error: source: root cause`, the form used for violation
/// messages.
pub fn error_chain_message(err: &dyn std::error::Error) -> String {
    std::iter::successors(Some(err), |err| err.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// The serial number of `certificate` in lowercase hex, for logging.
pub fn serial_hex(certificate: &X509Ref) -> String {
    certificate
        .serial_number()
        .to_bn()
        .and_then(|serial| serial.to_hex_str().map(|hex| hex.to_ascii_lowercase()))
        .unwrap_or_default()
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Asn1TimeError {
    #[snafu(display("unix epoch is not a valid Asn1Time"))]
    Epoch { source: openssl::error::ErrorStack },

    #[snafu(display("unable to diff Asn1Time"))]
    Diff { source: openssl::error::ErrorStack },

    #[snafu(display("time is out of range"))]
    OutOfRange { source: time::error::ComponentRange },

    #[snafu(display("time overflowed"))]
    Overflow,
}

/// The validity bound `asn` of a certificate as an [`OffsetDateTime`].
pub fn asn1_time_to_datetime(asn: &Asn1TimeRef) -> Result<OffsetDateTime, Asn1TimeError> {
    use asn1_time_error::*;
    const SECS_PER_DAY: i64 = 60 * 60 * 24;
    let epoch = Asn1Time::from_unix(0).context(EpochSnafu)?;
    let TimeDiff { days, secs } = epoch.diff(asn).context(DiffSnafu)?;
    let timestamp = i64::from(days)
        .checked_mul(SECS_PER_DAY)
        .and_then(|day_secs| day_secs.checked_add(i64::from(secs)))
        .context(OverflowSnafu)?;
    OffsetDateTime::from_unix_timestamp(timestamp).context(OutOfRangeSnafu)
}

pub fn datetime_to_asn1_time(time: OffsetDateTime) -> Result<Asn1Time, openssl::error::ErrorStack> {
    Asn1Time::from_unix(time.unix_timestamp())
}
