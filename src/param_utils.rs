use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;

/// Get a parameter value with a default fallback
pub fn get_param(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Extract a parameter as f64 and reject it when it is non-finite or outside `[min, max]`.
pub fn get_param_f64_in_range(
    params: &HashMap<String, f64>,
    key: &str,
    default: f64,
    min: f64,
    max: f64,
) -> EngineResult<f64> {
    let value = get_param(params, key, default);
    ensure_in_range(key, value, min, max)?;
    Ok(value)
}

/// Reject a non-finite value or one outside `[min, max]`.
pub fn ensure_in_range(key: &str, value: f64, min: f64, max: f64) -> EngineResult<()> {
    if !value.is_finite() {
        return Err(EngineError::config(format!(
            "parameter {} must be finite (value: {})",
            key, value
        )));
    }
    if value < min || value > max {
        return Err(EngineError::config(format!(
            "parameter {} must be within [{}, {}] (value: {})",
            key, min, max, value
        )));
    }
    Ok(())
}

/// Extract an integral parameter and reject fractional, non-finite or out-of-range values.
pub fn get_param_usize_in_range(
    params: &HashMap<String, f64>,
    key: &str,
    default: usize,
    min: usize,
    max: usize,
) -> EngineResult<usize> {
    let value = get_param_f64_in_range(params, key, default as f64, min as f64, max as f64)?;
    if value.fract() != 0.0 {
        return Err(EngineError::config(format!(
            "parameter {} must be an integer (value: {})",
            key, value
        )));
    }
    Ok(value as usize)
}

/// Keys present in `params` that are not in `known`, sorted for stable reporting.
pub fn unknown_params(params: &HashMap<String, f64>, known: &[&str]) -> Vec<String> {
    let mut unknown: Vec<String> = params
        .keys()
        .filter(|key| !known.contains(&key.as_str()))
        .cloned()
        .collect();
    unknown.sort();
    unknown
}
