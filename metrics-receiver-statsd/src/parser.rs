//! StatsD/DogStatsD line decoding.
//!
//! A line has the shape `<name>:<value>[:<value>...]|<type>[|<modifier>...]`, where modifiers are
//! a sample rate (`@0.5`), a tag set (`#k:v,k2:v2`), a container ID (`c:abc123`, DogStatsD v1.2),
//! or a timestamp in unix seconds (`T1656581400`, DogStatsD v1.3).
use metrics::Label;
use thiserror::Error;

use crate::identity::{MetricIdentity, MetricType};

const TAG_METRIC_TYPE: &str = "metric_type";
const TAG_CONTAINER_ID: &str = "container.id";
const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Errors that could occur while parsing a single line.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The line has no `|` separating the value from the type.
    #[error("invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// The section before the first `|` has no `:` separating the name from the value.
    #[error("invalid <name>:<value> format: {0}")]
    InvalidNameValueFormat(String),

    /// The metric name is empty.
    #[error("empty metric name")]
    EmptyName,

    /// The value list is empty, or one of its colon-separated values is empty.
    #[error("empty metric value")]
    EmptyValue,

    /// A value could not be parsed as a floating-point number.
    #[error("invalid metric value: {0}")]
    InvalidValue(String),

    /// The metric type code is not one of `c`, `g`, `h`, `ms`, or `d`.
    #[error("unsupported metric type: {0}")]
    UnsupportedType(String),

    /// The sample rate could not be parsed as a floating-point number.
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(String),

    /// A tag has an empty key, or has no value while simple tags are disabled.
    #[error("invalid tag format: {0:?}")]
    InvalidTagFormat(String),

    /// A timestamp was given for a type other than counter or gauge.
    #[error("timestamp not supported for {0} metrics, only for counter and gauge metrics")]
    TimestampNotSupported(MetricType),

    /// The timestamp is not a valid number of unix seconds.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// A modifier section with an unknown sigil.
    #[error("unrecognized message part: {0}")]
    UnrecognizedPart(String),
}

/// A single value of a decoded line.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Value {
    value: f64,
    is_delta: bool,
}

/// A decoded line: one identity shared by one or more values.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedLine {
    identity: MetricIdentity,
    values: Vec<Value>,
    sample_rate: f64,
    timestamp: Option<u64>,
}

impl ParsedLine {
    /// Returns the identity shared by every sample of the line.
    pub fn identity(&self) -> &MetricIdentity {
        &self.identity
    }

    /// Returns the number of samples on the line.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the line has no samples.
    ///
    /// A successfully parsed line always holds at least one sample.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns an iterator over the samples on the line, in wire order.
    pub fn samples(&self) -> impl ExactSizeIterator<Item = RawSample<'_>> + '_ {
        self.values.iter().map(move |v| RawSample {
            identity: &self.identity,
            value: v.value,
            is_delta: v.is_delta,
            sample_rate: self.sample_rate,
            timestamp: self.timestamp,
            unit: self.identity.metric_type().unit(),
        })
    }
}

/// One decoded value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawSample<'a> {
    /// Identity of the series the value belongs to.
    pub identity: &'a MetricIdentity,

    /// The value itself.
    pub value: f64,

    /// Whether the textual value carried an explicit sign, meaning "add to existing" for gauges.
    pub is_delta: bool,

    /// Client-declared sample rate. Defaults to 1.0.
    pub sample_rate: f64,

    /// Explicit timestamp in unix nanoseconds, if one was given.
    pub timestamp: Option<u64>,

    /// Unit of the value, or the empty string.
    pub unit: &'static str,
}

impl RawSample<'_> {
    /// Returns the repeat weight of the value, which is the sample rate itself.
    pub fn weight(&self) -> f64 {
        self.sample_rate
    }

    /// Returns the value as a counter increment.
    ///
    /// StatsD counters are integers, so the value is truncated. The sample rate does not scale it.
    pub fn counter_value(&self) -> i64 {
        self.value as i64
    }
}

/// Parses a single line.
///
/// The line must already be stripped of its line terminator. When `enable_metric_type` is set, a
/// `metric_type` attribute holding the human-readable type name is added to the identity. When
/// `enable_simple_tags` is set, tags without a value (`#foo`) are accepted with an empty value.
///
/// # Errors
///
/// If the line is malformed, an error is returned describing the first problem found.
pub fn parse_line(
    line: &str,
    enable_metric_type: bool,
    enable_simple_tags: bool,
) -> Result<ParsedLine, ParseError> {
    let (name_value, rest) = line
        .split_once('|')
        .ok_or_else(|| ParseError::InvalidMessageFormat(line.to_string()))?;

    let (name, values_str) = name_value
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidNameValueFormat(name_value.to_string()))?;

    if name.is_empty() {
        return Err(ParseError::EmptyName);
    }
    if values_str.is_empty() {
        return Err(ParseError::EmptyValue);
    }

    let (type_str, modifiers) = rest.split_once('|').unwrap_or((rest, ""));
    let metric_type = type_str
        .parse::<MetricType>()
        .map_err(|()| ParseError::UnsupportedType(type_str.to_string()))?;

    let mut labels = Vec::new();
    let mut sample_rate = 1.0;
    let mut timestamp = None;

    // An empty section ends the modifier list, and anything after it is ignored.
    for part in modifiers.split('|').take_while(|part| !part.is_empty()) {
        if let Some(rate) = part.strip_prefix('@') {
            sample_rate =
                rate.parse::<f64>().map_err(|_| ParseError::InvalidSampleRate(rate.to_string()))?;
        } else if let Some(tags) = part.strip_prefix('#') {
            parse_tags(tags, enable_simple_tags, &mut labels)?;
        } else if let Some(container_id) = part.strip_prefix("c:") {
            if !container_id.is_empty() {
                labels.push(Label::new(TAG_CONTAINER_ID, container_id.to_string()));
            }
        } else if let Some(seconds) = part.strip_prefix('T') {
            if !metric_type.supports_timestamp() {
                return Err(ParseError::TimestampNotSupported(metric_type));
            }

            let nanos = seconds
                .parse::<u64>()
                .ok()
                .and_then(|s| s.checked_mul(NANOS_PER_SECOND))
                .ok_or_else(|| ParseError::InvalidTimestamp(seconds.to_string()))?;
            timestamp = Some(nanos);
        } else {
            return Err(ParseError::UnrecognizedPart(part.to_string()));
        }
    }

    if enable_metric_type {
        labels.push(Label::new(TAG_METRIC_TYPE, metric_type.full_name()));
    }

    let values = values_str.split(':').map(parse_value).collect::<Result<Vec<_>, _>>()?;

    Ok(ParsedLine {
        identity: MetricIdentity::new(name, metric_type, labels),
        values,
        sample_rate,
        timestamp,
    })
}

fn parse_value(raw: &str) -> Result<Value, ParseError> {
    if raw.is_empty() {
        return Err(ParseError::EmptyValue);
    }

    let value = raw.parse::<f64>().map_err(|_| ParseError::InvalidValue(raw.to_string()))?;
    let is_delta = raw.starts_with('+') || raw.starts_with('-');

    Ok(Value { value, is_delta })
}

fn parse_tags(
    tags: &str,
    enable_simple_tags: bool,
    labels: &mut Vec<Label>,
) -> Result<(), ParseError> {
    // Some clients send the tag section even when there are no tags. An empty tag ends the set.
    for tag in tags.split(',').take_while(|tag| !tag.is_empty()) {
        let (key, value) = tag.split_once(':').unwrap_or((tag, ""));
        if key.is_empty() || (value.is_empty() && !enable_simple_tags) {
            return Err(ParseError::InvalidTagFormat(tag.to_string()));
        }

        labels.push(Label::new(key.to_string(), value.to_string()));
    }

    Ok(())
}
