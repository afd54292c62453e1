// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Screenshot naming on the coordinator side
//!
//! Callers identify a screenshot by a short tag; the file name sent to the
//! agent is the tag prefixed with the current epoch milliseconds so repeated
//! tags within one test method do not overwrite each other.

use chrono::Utc;

pub use shutter_protocol::naming::sanitize_component;

use crate::{CoordinatorError, Result};

/// Extension appended to every generated screenshot name
pub const EXTENSION: &str = "png";

/// Accept tags matching `[a-zA-Z0-9_-]+`.
pub fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidTag(tag.to_string()))
    }
}

/// `<epoch-millis>_<tag>.png`
pub fn screenshot_name(tag: &str) -> Result<String> {
    validate_tag(tag)?;
    Ok(format!(
        "{}_{tag}.{EXTENSION}",
        Utc::now().timestamp_millis()
    ))
}
