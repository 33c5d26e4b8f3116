//! Durations as cert-manager writes them, in Go's `time.ParseDuration` notation.
//!
//! Values may be fractional (`1.5h`), use sub-second units (`ns`, `us`, `µs`, `ms`), combine units
//! (`2h45m30.5s`) and carry a leading `+`. They are rendered the way Go prints them, so
//! `2160h` becomes `2160h0m0s` rather than being folded into days.

use std::{fmt::Display, ops::Deref, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, Snafu};
use stackable_operator::schemars::{
    self,
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(module)]
pub enum ParseDurationError {
    #[snafu(display("duration {duration:?} is empty or malformed"))]
    Malformed { duration: String },

    #[snafu(display("duration {duration:?} is negative"))]
    Negative { duration: String },

    #[snafu(display("duration {duration:?} is missing a unit"))]
    MissingUnit { duration: String },

    #[snafu(display("duration {duration:?} has unknown unit {unit:?}"))]
    UnknownUnit { duration: String, unit: String },

    #[snafu(display("duration {duration:?} is too large"))]
    Overflow { duration: String },
}

/// A non-negative duration in the notation used throughout the cert-manager API, such as
/// `2160h0m0s`, `90m` or `1.5h`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct GoDuration(Duration);

impl GoDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_hours(hours: u64) -> Self {
        Self::from_secs(hours * 60 * 60)
    }
}

impl From<Duration> for GoDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl Deref for GoDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromStr for GoDuration {
    type Err = ParseDurationError;

    fn from_str(duration: &str) -> Result<Self, Self::Err> {
        use parse_duration_error::*;

        let unsigned = duration.strip_prefix('+').unwrap_or(duration);
        ensure!(!unsigned.starts_with('-'), NegativeSnafu { duration });
        if unsigned == "0" {
            return Ok(Self(Duration::ZERO));
        }
        ensure!(!unsigned.is_empty(), MalformedSnafu { duration });

        let mut rest = unsigned;
        let mut total: u128 = 0;
        while !rest.is_empty() {
            let (int, after) = split_digits(rest);
            let (frac, after) = match after.strip_prefix('.') {
                Some(after) => split_digits(after),
                None => ("", after),
            };
            ensure!(!int.is_empty() || !frac.is_empty(), MalformedSnafu { duration });

            let unit_len = after
                .find(|c: char| c == '.' || c.is_ascii_digit())
                .unwrap_or(after.len());
            let (unit, after) = after.split_at(unit_len);
            let scale: u128 = match unit {
                "ns" => 1,
                "us" | "µs" | "μs" => 1_000,
                "ms" => 1_000_000,
                "s" => NANOS_PER_SECOND,
                "m" => 60 * NANOS_PER_SECOND,
                "h" => 60 * 60 * NANOS_PER_SECOND,
                "" => return MissingUnitSnafu { duration }.fail(),
                _ => return UnknownUnitSnafu { duration, unit }.fail(),
            };

            let whole: u128 = if int.is_empty() {
                0
            } else {
                int.parse().ok().context(OverflowSnafu { duration })?
            };
            let mut value = whole.checked_mul(scale).context(OverflowSnafu { duration })?;
            if !frac.is_empty() {
                // anything beyond nanosecond precision is truncated anyway
                let digits = &frac[..frac.len().min(18)];
                let numerator: u128 = digits.parse().ok().context(OverflowSnafu { duration })?;
                value += numerator * scale / 10u128.pow(digits.len() as u32);
            }
            total = total.checked_add(value).context(OverflowSnafu { duration })?;
            rest = after;
        }

        let secs = u64::try_from(total / NANOS_PER_SECOND)
            .ok()
            .context(OverflowSnafu { duration })?;
        Ok(Self(Duration::new(secs, (total % NANOS_PER_SECOND) as u32)))
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()))
}

impl TryFrom<String> for GoDuration {
    type Error = ParseDurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GoDuration> for String {
    fn from(value: GoDuration) -> Self {
        value.to_string()
    }
}

impl Display for GoDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        if nanos < NANOS_PER_SECOND {
            let (unit, scale) = match nanos {
                0..=999 => ("ns", 1),
                1_000..=999_999 => ("µs", 1_000),
                _ => ("ms", 1_000_000),
            };
            return write!(f, "{}{unit}", fraction(nanos, scale));
        }

        let secs = self.0.as_secs();
        let (hours, minutes) = (secs / 3600, secs / 60 % 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        let second_nanos = u128::from(secs % 60) * NANOS_PER_SECOND + u128::from(self.0.subsec_nanos());
        write!(f, "{}s", fraction(second_nanos, NANOS_PER_SECOND))
    }
}

fn fraction(value: u128, scale: u128) -> String {
    let (whole, frac) = (value / scale, value % scale);
    if frac == 0 {
        whole.to_string()
    } else {
        let width = scale.ilog10() as usize;
        let digits = format!("{frac:0width$}");
        format!("{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl JsonSchema for GoDuration {
    fn schema_name() -> String {
        "GoDuration".to_string()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            ..SchemaObject::default()
        }
        .into()
    }
}
