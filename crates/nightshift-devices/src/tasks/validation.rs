//! Range validation for observation task parameters.
//!
//! Schema validation checks JSON kinds; these checks enforce the physical
//! ranges the hardware accepts. All failures are parameter errors and are
//! never retried.

use nightshift_types::TaskError;

pub const MIN_EXPOSURE_SECS: f64 = 0.0001;
pub const MAX_EXPOSURE_SECS: f64 = 7200.0;
pub const MIN_GAIN: i64 = 0;
pub const MAX_GAIN: i64 = 1000;
pub const MIN_OFFSET: i64 = 0;
pub const MAX_OFFSET: i64 = 500;
pub const MAX_COUNT: i64 = 10_000;
pub const MAX_FOCUS_POSITION: i64 = 100_000;

fn invalid(message: String) -> TaskError {
    TaskError::InvalidParameter {
        errors: vec![message],
    }
}

pub fn validate_exposure(seconds: f64) -> Result<(), TaskError> {
    if !(MIN_EXPOSURE_SECS..=MAX_EXPOSURE_SECS).contains(&seconds) {
        return Err(invalid(format!(
            "exposure must be between {MIN_EXPOSURE_SECS} and {MAX_EXPOSURE_SECS} seconds, got {seconds}"
        )));
    }
    Ok(())
}

pub fn validate_gain(gain: i64) -> Result<(), TaskError> {
    if !(MIN_GAIN..=MAX_GAIN).contains(&gain) {
        return Err(invalid(format!(
            "gain must be between {MIN_GAIN} and {MAX_GAIN}, got {gain}"
        )));
    }
    Ok(())
}

pub fn validate_offset(offset: i64) -> Result<(), TaskError> {
    if !(MIN_OFFSET..=MAX_OFFSET).contains(&offset) {
        return Err(invalid(format!(
            "offset must be between {MIN_OFFSET} and {MAX_OFFSET}, got {offset}"
        )));
    }
    Ok(())
}

pub fn validate_count(count: i64) -> Result<(), TaskError> {
    if !(1..=MAX_COUNT).contains(&count) {
        return Err(invalid(format!(
            "count must be between 1 and {MAX_COUNT}, got {count}"
        )));
    }
    Ok(())
}

pub fn validate_focus_position(position: i64) -> Result<(), TaskError> {
    if !(0..=MAX_FOCUS_POSITION).contains(&position) {
        return Err(invalid(format!(
            "focus position must be between 0 and {MAX_FOCUS_POSITION}, got {position}"
        )));
    }
    Ok(())
}
