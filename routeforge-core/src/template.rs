//! Route templates, path parameter extraction and parameter type inference.
//!
//! A route template is a path in which some segments are parameters. A parameter
//! segment is written either as `:name:` or as `{name}`; both forms may be mixed in
//! the same template:
//!
//! ```text
//! /users/{id}/posts/:slug:
//! ```
//!
//! Extraction walks the template and a concrete request path segment by segment
//! (leading and trailing slashes are ignored). When the two paths have a different
//! number of segments nothing is extracted; callers detect that through their own
//! arity checks.
//!
//! Each extracted raw value is percent-decoded and its type is inferred once, first
//! match wins:
//!
//! 1. all digits with an optional decimal point: `decimal` → `double` → `float` for
//!    dotted literals, `int` → `long` → `BigInt` otherwise
//! 2. a GUID
//! 3. a date-time (culture invariant formats)
//! 4. anything else stays a string
//!
//! # Examples
//!
//! ```
//! use routeforge_core::template::{ParamKind, RouteTemplate};
//!
//! let route = RouteTemplate::new("/orders/{id}/:when:", "/orders/42/2024-01-15");
//! let params = route.parameters();
//!
//! assert_eq!(params[0].name(), "id");
//! assert_eq!(params[0].kind(), ParamKind::Int);
//! assert_eq!(params[1].kind(), ParamKind::DateTime);
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use num_bigint::BigInt;
use percent_encoding::percent_decode_str;
use regex::Regex;
use rust_decimal::Decimal;
use uuid::Uuid;

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.)?\d*$").expect("numeric literal pattern is valid")
});

/// Number of characters in `decimal`'s largest printable value (79228162514264337593543950335).
const DECIMAL_MAX_PRINTABLE_LEN: usize = 29;

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

/// The inferred type of a route parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// No more specific type matched.
    String,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    Long,
    /// Arbitrary precision integer. Never coerced to a fixed-width numeric type.
    BigInt,
    /// 96-bit decimal.
    Decimal,
    /// 64-bit float.
    Double,
    /// 32-bit float.
    Float,
    /// GUID / UUID.
    Guid,
    /// Date and time without offset.
    DateTime,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::String => "string",
            ParamKind::Int => "int",
            ParamKind::Long => "long",
            ParamKind::BigInt => "BigInteger",
            ParamKind::Decimal => "decimal",
            ParamKind::Double => "double",
            ParamKind::Float => "float",
            ParamKind::Guid => "Guid",
            ParamKind::DateTime => "DateTime",
        };
        f.write_str(name)
    }
}

/// A typed route parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Untransformed text.
    String(String),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `BigInteger`
    BigInt(BigInt),
    /// `decimal`
    Decimal(Decimal),
    /// `double`
    Double(f64),
    /// `float`
    Float(f32),
    /// `Guid`
    Guid(Uuid),
    /// `DateTime`
    DateTime(NaiveDateTime),
}

impl ParamValue {
    /// Infers the most specific value a raw path segment supports.
    pub fn infer(raw: &str) -> Self {
        if NUMERIC.is_match(raw) {
            return Self::infer_numeric(raw);
        }
        if let Ok(guid) = Uuid::parse_str(raw) {
            return ParamValue::Guid(guid);
        }
        if let Some(when) = parse_date_time(raw) {
            return ParamValue::DateTime(when);
        }
        ParamValue::String(raw.to_string())
    }

    fn infer_numeric(raw: &str) -> Self {
        if raw.contains('.') {
            if raw.len() <= DECIMAL_MAX_PRINTABLE_LEN {
                if let Ok(value) = Decimal::from_str(raw) {
                    return ParamValue::Decimal(value);
                }
            }
            if let Ok(value) = raw.parse::<f64>() {
                if value.is_finite() {
                    return ParamValue::Double(value);
                }
            }
            if let Ok(value) = raw.parse::<f32>() {
                if value.is_finite() {
                    return ParamValue::Float(value);
                }
            }
            return ParamValue::String(raw.to_string());
        }

        if let Ok(value) = raw.parse::<i32>() {
            return ParamValue::Int(value);
        }
        if let Ok(value) = raw.parse::<i64>() {
            return ParamValue::Long(value);
        }
        match BigInt::from_str(raw) {
            Ok(value) => ParamValue::BigInt(value),
            Err(_) => ParamValue::String(raw.to_string()),
        }
    }

    /// The kind of this value.
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::String(_) => ParamKind::String,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Long(_) => ParamKind::Long,
            ParamValue::BigInt(_) => ParamKind::BigInt,
            ParamValue::Decimal(_) => ParamKind::Decimal,
            ParamValue::Double(_) => ParamKind::Double,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Guid(_) => ParamKind::Guid,
            ParamValue::DateTime(_) => ParamKind::DateTime,
        }
    }

    /// Whether the value may be converted to another numeric type.
    ///
    /// `BigInt` values are excluded so that oversized literals never lose precision
    /// by being narrowed silently.
    pub fn is_numeric_coercible(&self) -> bool {
        matches!(
            self,
            ParamValue::Int(_)
                | ParamValue::Long(_)
                | ParamValue::Decimal(_)
                | ParamValue::Double(_)
                | ParamValue::Float(_)
        )
    }
}

fn parse_date_time(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(when) = DateTime::parse_from_rfc3339(raw) {
        return Some(when.naive_utc());
    }
    for format in DATE_TIME_FORMATS {
        if let Ok(when) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(when);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// A single parameter extracted from a request path.
///
/// Created once per request during extraction and never modified afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteParameter {
    name: String,
    raw: String,
    value: ParamValue,
}

impl RouteParameter {
    /// Builds a parameter from its template name and the raw request segment.
    pub fn new(name: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let value = ParamValue::infer(&raw);
        Self {
            name: name.into(),
            raw,
            value,
        }
    }

    /// Name declared in the template.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decoded segment text, before type inference.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Inferred kind.
    pub fn kind(&self) -> ParamKind {
        self.value.kind()
    }

    /// Inferred value.
    pub fn value(&self) -> &ParamValue {
        &self.value
    }
}

/// A route template matched against one concrete request path.
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    template: String,
    request_path: String,
    parameters: Vec<RouteParameter>,
}

impl RouteTemplate {
    /// Extracts the parameters of `request_path` according to `template`.
    pub fn new(template: impl Into<String>, request_path: impl Into<String>) -> Self {
        let template = template.into();
        let request_path = request_path.into();
        let parameters = extract_parameters(&template, &request_path);
        Self {
            template,
            request_path,
            parameters,
        }
    }

    /// The template string.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The request path the parameters were taken from.
    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// Extracted parameters in template order.
    pub fn parameters(&self) -> &[RouteParameter] {
        &self.parameters
    }

    /// Consumes the template, returning its parameters.
    pub fn into_parameters(self) -> Vec<RouteParameter> {
        self.parameters
    }
}

fn segments(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

/// Returns the parameter name when `segment` is written as `:name:` or `{name}`.
pub fn parameter_name(segment: &str) -> Option<&str> {
    let inner = if segment.len() > 2 && segment.starts_with(':') && segment.ends_with(':') {
        &segment[1..segment.len() - 1]
    } else if segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}') {
        &segment[1..segment.len() - 1]
    } else {
        return None;
    };
    Some(inner)
}

/// Whether `segment` is a parameter segment.
pub fn is_parameter_segment(segment: &str) -> bool {
    parameter_name(segment).is_some()
}

/// Whether the path contains at least one parameter segment.
pub fn is_templated(path: &str) -> bool {
    segments(path).into_iter().any(is_parameter_segment)
}

/// Number of parameter segments in a template.
pub fn parameter_count(template: &str) -> usize {
    segments(template)
        .into_iter()
        .filter(|segment| is_parameter_segment(segment))
        .count()
}

/// Compiles a template into an anchored regex in which every parameter segment
/// matches anything (`.*`) and every literal segment matches itself.
pub fn template_regex(template: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::from("^");
    let mut first = true;
    for segment in template.split('/') {
        if !first {
            pattern.push('/');
        }
        first = false;
        if is_parameter_segment(segment) {
            pattern.push_str(".*");
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

fn extract_parameters(template: &str, request_path: &str) -> Vec<RouteParameter> {
    let template_segments = segments(template);
    let request_segments = segments(request_path);

    if template_segments.len() != request_segments.len() {
        return Vec::new();
    }

    template_segments
        .iter()
        .zip(request_segments.iter())
        .filter_map(|(template_segment, request_segment)| {
            parameter_name(template_segment).map(|name| {
                let raw = percent_decode_str(request_segment).decode_utf8_lossy();
                RouteParameter::new(name, raw.into_owned())
            })
        })
        .collect()
}
