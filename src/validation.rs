//! Request-boundary checks turning untrusted payloads into [`Metric`]s.

use crate::error::ValidationError;
use crate::model::{Metric, MetricId, MetricKind, MetricPayload};

/// A name is valid when non-empty and ASCII alphanumeric.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ValidationError::InvalidName { name: name.to_string() });
    }
    Ok(())
}

pub fn parse_kind(kind: &str) -> Result<MetricKind, ValidationError> {
    kind.parse()
}

/// Validate one payload. Checks run kind, name, then value slot.
pub fn validate(payload: MetricPayload) -> Result<Metric, ValidationError> {
    let kind = parse_kind(&payload.kind)?;
    validate_name(&payload.id)?;

    match kind {
        MetricKind::Counter => {
            let delta = payload
                .delta
                .ok_or_else(|| ValidationError::MissingDelta { name: payload.id.clone() })?;
            Ok(Metric { id: MetricId::counter(payload.id), delta: Some(delta), value: None })
        }
        MetricKind::Gauge => {
            let value = payload
                .value
                .ok_or_else(|| ValidationError::MissingValue { name: payload.id.clone() })?;
            Ok(Metric { id: MetricId::gauge(payload.id), delta: None, value: Some(value) })
        }
    }
}

/// Validate a whole request; the first invalid entry fails everything.
pub fn validate_all(payloads: Vec<MetricPayload>) -> Result<Vec<Metric>, ValidationError> {
    payloads.into_iter().map(validate).collect()
}

/// Build a payload from the legacy `/update/{type}/{name}/{value}` path.
pub fn payload_from_path(kind: &str, name: &str, raw: &str) -> Result<MetricPayload, ValidationError> {
    let parsed = parse_kind(kind)?;
    validate_name(name)?;

    let payload = match parsed {
        MetricKind::Counter => {
            let delta = raw
                .parse::<i64>()
                .map_err(|_| ValidationError::InvalidCounterValue { raw: raw.to_string() })?;
            MetricPayload::counter(name, delta)
        }
        MetricKind::Gauge => {
            let value = raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ValidationError::InvalidGaugeValue { raw: raw.to_string() })?;
            MetricPayload::gauge(name, value)
        }
    };
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_well_formed() {
        assert_eq!(validate(MetricPayload::counter("hits", 3)).unwrap(), Metric::counter("hits", 3));
        assert_eq!(validate(MetricPayload::gauge("Temp1", 1.5)).unwrap(), Metric::gauge("Temp1", 1.5));
    }

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "with space", "dash-ed", "under_score", "dot.ted", "ünï"] {
            let err = validate(MetricPayload::gauge(name, 1.0)).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidName { .. }), "{name}");
        }
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let payload = MetricPayload { id: "x".into(), kind: "histogram".into(), value: Some(1.0), delta: None };
        assert!(matches!(validate(payload), Err(ValidationError::InvalidKind { .. })));
    }

    #[test]
    fn test_rejects_missing_slot() {
        let counter = MetricPayload { id: "x".into(), kind: "counter".into(), value: Some(1.0), delta: None };
        assert!(matches!(validate(counter), Err(ValidationError::MissingDelta { .. })));

        let gauge = MetricPayload { id: "x".into(), kind: "gauge".into(), value: None, delta: Some(1) };
        assert!(matches!(validate(gauge), Err(ValidationError::MissingValue { .. })));
    }

    #[test]
    fn test_validate_all_is_fail_fast() {
        let batch = vec![
            MetricPayload::counter("ok", 1),
            MetricPayload::counter("", 1),
            MetricPayload { id: "x".into(), kind: "nope".into(), ..Default::default() },
        ];
        let err = validate_all(batch).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidName { .. }));
    }

    #[test]
    fn test_payload_from_path() {
        assert_eq!(payload_from_path("counter", "hits", "10").unwrap(), MetricPayload::counter("hits", 10));
        assert_eq!(payload_from_path("gauge", "temp", "36.6").unwrap(), MetricPayload::gauge("temp", 36.6));
        assert!(matches!(
            payload_from_path("counter", "hits", "1.5"),
            Err(ValidationError::InvalidCounterValue { .. })
        ));
        assert!(matches!(
            payload_from_path("gauge", "temp", "abc"),
            Err(ValidationError::InvalidGaugeValue { .. })
        ));
        assert!(matches!(
            payload_from_path("gauge", "temp", "NaN"),
            Err(ValidationError::InvalidGaugeValue { .. })
        ));
        assert!(matches!(payload_from_path("meter", "x", "1"), Err(ValidationError::InvalidKind { .. })));
    }
}
