//! Instance identifiers.
//!
//! Full form: `projects/P/locations/R/clusters/C/instances/I` where `P`
//! matches `[^:]+(:[^:]+)?` and `R`, `C`, `I` are nonempty. Short form:
//! `P.R.C.I` with any `:` in `P` replaced by `_` (the escape is reserved,
//! so a project component containing `_` has no valid short form that
//! round-trips through `toFull`).

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

fn grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^projects/([^:/]+(?::[^:/]+)?)/locations/([^/]+)/clusters/([^/]+)/instances/([^/]+)$",
        )
        .expect("static regex is valid")
    })
}

/// A parsed, validated instance identifier.
///
/// Immutable once constructed; `Display` renders the full form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    project: String,
    location: String,
    cluster: String,
    instance: String,
}

impl InstanceId {
    /// Parses the full `projects/.../instances/...` form, rejecting anything
    /// that does not match the grammar above.
    pub fn parse(full: &str) -> Result<Self, ConfigError> {
        let caps = grammar()
            .captures(full)
            .ok_or_else(|| ConfigError::InvalidInstanceId(full.to_string()))?;
        Ok(Self {
            project: caps[1].to_string(),
            location: caps[2].to_string(),
            cluster: caps[3].to_string(),
            instance: caps[4].to_string(),
        })
    }

    /// Parses the dot-joined short form `P.R.C.I`, undoing the `:` -> `_`
    /// escape applied by [`Self::short_form`]. Rejects any value beginning
    /// with `.`.
    pub fn from_short_form(short: &str) -> Result<Self, ConfigError> {
        if short.starts_with('.') {
            return Err(ConfigError::InvalidShortId(short.to_string()));
        }
        let parts: Vec<&str> = short.splitn(4, '.').collect();
        let [project, location, cluster, instance] = parts.as_slice() else {
            return Err(ConfigError::InvalidShortId(short.to_string()));
        };
        if project.is_empty() || location.is_empty() || cluster.is_empty() || instance.is_empty()
        {
            return Err(ConfigError::InvalidShortId(short.to_string()));
        }
        let project = project.replace('_', ":");
        Ok(Self {
            project,
            location: location.to_string(),
            cluster: cluster.to_string(),
            instance: instance.to_string(),
        })
    }

    /// Windows-safe, filesystem-safe short form: `P.R.C.I` with any `:` in
    /// `P` replaced by `_`.
    pub fn short_form(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.project.replace(':', "_"),
            self.location,
            self.cluster,
            self.instance
        )
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/clusters/{}/instances/{}",
            self.project, self.location, self.cluster, self.instance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_identifier() {
        let id = InstanceId::parse("projects/proj/locations/region/clusters/clust/instances/inst")
            .unwrap();
        assert_eq!(id.project(), "proj");
        assert_eq!(id.location(), "region");
        assert_eq!(id.cluster(), "clust");
        assert_eq!(id.instance(), "inst");
    }

    #[test]
    fn parses_project_with_colon() {
        let id = InstanceId::parse(
            "projects/my:legacy/locations/region/clusters/clust/instances/inst",
        )
        .unwrap();
        assert_eq!(id.project(), "my:legacy");
        assert_eq!(id.short_form(), "my_legacy.region.clust.inst");
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for bad in [
            "projects//locations/r/clusters/c/instances/i",
            "projects/p/locations/r/clusters/c/instances/",
            "not-even-close",
            "projects/p/locations/r/clusters/c",
        ] {
            assert!(InstanceId::parse(bad).is_err(), "expected {bad:?} to be rejected");
        }
    }

    #[test]
    fn short_form_round_trips() {
        let id =
            InstanceId::parse("projects/proj/locations/region/clusters/clust/instances/inst")
                .unwrap();
        let short = id.short_form();
        assert_eq!(short, "proj.region.clust.inst");
        let back = InstanceId::from_short_form(&short).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn to_short_to_full_to_short_is_idempotent() {
        // toShort(toFull(toShort(x))) == toShort(x) for valid short forms
        // whose project component contains no `_`.
        for short in ["proj.region.clust.inst", "a.b.c.d"] {
            let once = InstanceId::from_short_form(short).unwrap().short_form();
            let twice = InstanceId::from_short_form(&once).unwrap().short_form();
            assert_eq!(once, twice);
            assert_eq!(once, short);
        }
    }

    #[test]
    fn short_form_rejects_leading_dot() {
        assert!(InstanceId::from_short_form(".region.clust.inst").is_err());
    }

    #[test]
    fn short_form_escapes_colon() {
        let id = InstanceId::from_short_form("my_legacy.region.clust.inst").unwrap();
        assert_eq!(id.project(), "my:legacy");
    }
}
