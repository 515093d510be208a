//! Platform defaults
//!
//! Each application platform has its own enrollment source and its own
//! default metric set.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How enrollments are discovered for a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrollmentsQueryType {
    /// Desktop enrollment events
    Normandy,
    /// Glean enrollment events
    GleanEvent,
    /// Glean events with a fallback on baseline pings
    FenixFallback,
}

impl EnrollmentsQueryType {
    /// Name as used in config files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normandy => "normandy",
            Self::GleanEvent => "glean-event",
            Self::FenixFallback => "fenix-fallback",
        }
    }
}

/// An application platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    app_name: String,
    enrollments_query_type: EnrollmentsQueryType,
}

const FIREFOX_DESKTOP_DEFAULTS: &str = include_str!("defaults/firefox_desktop.toml");
const FENIX_DEFAULTS: &str = include_str!("defaults/fenix.toml");

impl Platform {
    /// Look up a platform by application name.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unknown applications.
    pub fn for_app_name(app_name: &str) -> Result<Self> {
        let enrollments_query_type = match app_name {
            "firefox_desktop" => EnrollmentsQueryType::Normandy,
            "fenix" => EnrollmentsQueryType::FenixFallback,
            "firefox_ios" | "focus_android" | "klar_android" => EnrollmentsQueryType::GleanEvent,
            other => return Err(Error::Config(format!("Unknown platform {other}"))),
        };
        Ok(Self {
            app_name: app_name.to_string(),
            enrollments_query_type,
        })
    }

    /// Application name.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Enrollment discovery strategy.
    #[must_use]
    pub const fn enrollments_query_type(&self) -> EnrollmentsQueryType {
        self.enrollments_query_type
    }

    /// Embedded default spec, if the platform ships one.
    #[must_use]
    pub fn default_spec_toml(&self) -> Option<&'static str> {
        match self.app_name.as_str() {
            "firefox_desktop" => Some(FIREFOX_DESKTOP_DEFAULTS),
            "fenix" => Some(FENIX_DEFAULTS),
            _ => None,
        }
    }
}
