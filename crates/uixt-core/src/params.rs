//! Typed coercion of action parameters.
//!
//! Action descriptors carry their `params` as arbitrary JSON. Each function
//! here accepts the shapes a method is documented to take and rejects
//! everything else with [`DriverError::InvalidParams`], naming the method.

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::driver::{DriverError, Result};
use crate::geometry::Rotation;
use crate::info::LoginCredentials;

fn invalid(method: &str, expected: &str, got: &Value) -> DriverError {
    DriverError::InvalidParams(format!("{method}: expected {expected}, got {got}"))
}

/// Reads a number, accepting numeric strings.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn string(method: &str, params: &Value) -> Result<String> {
    match params {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        other => Err(invalid(method, "a non-empty string", other)),
    }
}

/// A string or an array of strings.
pub fn strings(method: &str, params: &Value) -> Result<Vec<String>> {
    match params {
        Value::String(s) if !s.is_empty() => Ok(vec![s.clone()]),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                other => Err(invalid(method, "an array of strings", other)),
            })
            .collect(),
        other => Err(invalid(method, "a string or an array of strings", other)),
    }
}

fn numbers<const N: usize>(method: &str, params: &Value) -> Result<[f64; N]> {
    let expected = format!("an array of {N} numbers");
    let Value::Array(items) = params else {
        return Err(invalid(method, &expected, params));
    };
    if items.len() != N {
        return Err(invalid(method, &expected, params));
    }
    let mut out = [0.0; N];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = number(item).ok_or_else(|| invalid(method, &expected, params))?;
    }
    Ok(out)
}

/// `[x, y]`.
pub fn point(method: &str, params: &Value) -> Result<[f64; 2]> {
    numbers::<2>(method, params)
}

/// `[from_x, from_y, to_x, to_y]`.
pub fn vector(method: &str, params: &Value) -> Result<[f64; 4]> {
    numbers::<4>(method, params)
}

/// A non-negative count, e.g. the number of backspaces.
pub fn count(method: &str, params: &Value) -> Result<usize> {
    match number(params) {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(invalid(method, "a non-negative integer", params)),
    }
}

/// Seconds as a number or numeric string.
pub fn seconds(method: &str, params: &Value) -> Result<Duration> {
    match number(params) {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(invalid(method, "a non-negative number of seconds", params)),
    }
}

pub fn millis(method: &str, params: &Value) -> Result<Duration> {
    match number(params) {
        Some(ms) if ms.is_finite() && ms >= 0.0 => Ok(Duration::from_secs_f64(ms / 1000.0)),
        _ => Err(invalid(method, "a non-negative number of milliseconds", params)),
    }
}

/// A random sleep in seconds.
///
/// `[min, max]` sleeps uniformly within the range. `[min1, max1, w1, min2,
/// max2, w2, ...]` first picks a range with probability proportional to its
/// weight, then sleeps uniformly within it.
pub fn random_sleep(method: &str, params: &Value) -> Result<Duration> {
    let expected = "[min, max] or [min, max, weight, ...] seconds";
    let Value::Array(items) = params else {
        return Err(invalid(method, expected, params));
    };
    let values = items
        .iter()
        .map(number)
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| invalid(method, expected, params))?;
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(invalid(method, expected, params));
    }

    let mut rng = rand::thread_rng();
    let (min, max) = match values.len() {
        2 => (values[0], values[1]),
        n if n > 0 && n % 3 == 0 => {
            let total: f64 = values.chunks(3).map(|c| c[2]).sum();
            if total <= 0.0 {
                return Err(invalid(method, "positive weights", params));
            }
            let mut pick = rng.gen_range(0.0..total);
            let mut chosen = (values[0], values[1]);
            for chunk in values.chunks(3) {
                if pick < chunk[2] {
                    chosen = (chunk[0], chunk[1]);
                    break;
                }
                pick -= chunk[2];
            }
            chosen
        }
        _ => return Err(invalid(method, expected, params)),
    };

    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let secs = if lo < hi { rng.gen_range(lo..=hi) } else { lo };
    Ok(Duration::from_secs_f64(secs))
}

/// A rotation object `{"z": 90}` or a bare angle.
pub fn rotation(method: &str, params: &Value) -> Result<Rotation> {
    if let Some(z) = number(params) {
        return Ok(Rotation::z(z as i32));
    }
    serde_json::from_value(params.clone())
        .map_err(|_| invalid(method, "a rotation object or angle", params))
}

pub fn credentials(method: &str, params: &Value) -> Result<LoginCredentials> {
    if !params.is_object() {
        return Err(invalid(method, "an object with phone/captcha/password", params));
    }
    serde_json::from_value(params.clone())
        .map_err(|e| DriverError::InvalidParams(format!("{method}: {e}")))
}
