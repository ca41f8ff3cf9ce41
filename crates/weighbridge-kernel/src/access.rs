//! [`AccessEvaluator`] – may this computer operate that scale?
//!
//! A station matches a [`ClientIdentity`] when it is active and either
//!
//! 1. **hostname** – the client hostname equals an allowed hostname, or
//!    (under the default [`HostnameMatch::Substring`] policy) contains one;
//! 2. **IP** – the observed IP is literally one of the allowed IPs.
//!
//! Stations are tried in registration order and the first match is the one
//! reported.  Evaluation only reads the registry.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use weighbridge_kernel::{AccessEvaluator, ScaleRegistry};
//! use weighbridge_types::{ClientIdentity, NewStation};
//!
//! let registry = Arc::new(ScaleRegistry::new());
//! registry
//!     .register(NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5"))
//!     .unwrap();
//!
//! let evaluator = AccessEvaluator::new(Arc::clone(&registry));
//! let decision = evaluator.evaluate(&ClientIdentity::observe("x", Some("10.0.0.5"), None, None));
//! assert!(decision.has_access);
//! assert_eq!(decision.station.unwrap().id, "S1");
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use weighbridge_types::{AccessDecision, ClientIdentity, ScaleError, ScaleStation};

use crate::station_registry::{ScaleRegistry, collect_allowed_ips};

/// How client hostnames are compared with allowed hostnames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostnameMatch {
    /// Equal, or the client hostname contains the allowed one.  Loose and
    /// spoofable, kept for compatibility with existing station lists.
    #[default]
    Substring,
    /// Equal only.
    Exact,
}

impl HostnameMatch {
    pub fn matches(self, client: &str, allowed: &str) -> bool {
        if client.is_empty() || allowed.is_empty() {
            return false;
        }
        match self {
            HostnameMatch::Substring => client == allowed || client.contains(allowed),
            HostnameMatch::Exact => client == allowed,
        }
    }
}

impl std::str::FromStr for HostnameMatch {
    type Err = ScaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substring" => Ok(HostnameMatch::Substring),
            "exact" => Ok(HostnameMatch::Exact),
            other => Err(ScaleError::InvalidOperation(format!(
                "unknown hostname match policy '{other}'"
            ))),
        }
    }
}

/// Evaluates client identities against a shared [`ScaleRegistry`].
#[derive(Clone)]
pub struct AccessEvaluator {
    registry: Arc<ScaleRegistry>,
    policy: HostnameMatch,
}

impl AccessEvaluator {
    /// Evaluator using the default [`HostnameMatch::Substring`] policy.
    pub fn new(registry: Arc<ScaleRegistry>) -> Self {
        Self::with_policy(registry, HostnameMatch::default())
    }

    pub fn with_policy(registry: Arc<ScaleRegistry>, policy: HostnameMatch) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> HostnameMatch {
        self.policy
    }

    pub fn registry(&self) -> &Arc<ScaleRegistry> {
        &self.registry
    }

    /// Match `identity` against every active station.
    ///
    /// `has_access` is `true` iff any active station matches; `station` is
    /// the first match in registration order.
    pub fn evaluate(&self, identity: &ClientIdentity) -> AccessDecision {
        let (station, allowed_ips) = self.registry.with_stations(|stations| {
            let matched = stations
                .iter()
                .find(|s| self.station_matches(s, identity))
                .cloned();
            (matched, collect_allowed_ips(stations))
        });

        match &station {
            Some(s) => debug!(hostname = %identity.hostname, ip = ?identity.ip, station = %s.id, "access granted"),
            None => warn!(hostname = %identity.hostname, ip = ?identity.ip, "access denied: no matching station"),
        }

        AccessDecision {
            has_access: station.is_some(),
            station,
            allowed_ips,
            timestamp: Utc::now(),
        }
    }

    /// Authorise `identity` for one specific device.
    ///
    /// # Errors
    ///
    /// - [`ScaleError::NotFound`] – no station with that id.
    /// - [`ScaleError::AccessDenied`] – the station is inactive or does not
    ///   list this client.
    pub fn authorize(&self, identity: &ClientIdentity, device_id: &str) -> Result<ScaleStation, ScaleError> {
        let station = self.registry.get(device_id)?;
        if self.station_matches(&station, identity) {
            debug!(hostname = %identity.hostname, station = %device_id, "device access granted");
            Ok(station)
        } else {
            warn!(hostname = %identity.hostname, ip = ?identity.ip, station = %device_id, "device access denied");
            Err(ScaleError::AccessDenied {
                hostname: identity.hostname.clone(),
                ip: identity.ip.clone().unwrap_or_else(|| "unknown".to_string()),
            })
        }
    }

    fn station_matches(&self, station: &ScaleStation, identity: &ClientIdentity) -> bool {
        if !station.is_active {
            return false;
        }
        let by_hostname = station
            .allowed_hostnames
            .iter()
            .any(|allowed| self.policy.matches(&identity.hostname, allowed));
        let by_ip = identity
            .ip
            .as_deref()
            .is_some_and(|ip| station.allowed_ips.iter().any(|allowed| allowed == ip));
        by_hostname || by_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weighbridge_types::{NewStation, StationPatch};

    fn identity(hostname: &str, ip: Option<&str>) -> ClientIdentity {
        ClientIdentity::observe(hostname, ip, None, None)
    }

    fn registry_with(stations: Vec<NewStation>) -> Arc<ScaleRegistry> {
        let registry = Arc::new(ScaleRegistry::new());
        for s in stations {
            registry.register(s).unwrap();
        }
        registry
    }

    #[test]
    fn ip_match_grants_access() {
        let registry = registry_with(vec![NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5")]);
        let decision = AccessEvaluator::new(registry).evaluate(&identity("x", Some("10.0.0.5")));
        assert!(decision.has_access);
        assert_eq!(decision.station.unwrap().id, "S1");
        assert_eq!(decision.allowed_ips, vec!["10.0.0.5"]);
    }

    #[test]
    fn hostname_match_ignores_ip() {
        let registry = registry_with(vec![
            NewStation::new("Gate A").with_id("S1").allow_hostname("weigh-pc").allow_ip("10.0.0.5"),
        ]);
        let evaluator = AccessEvaluator::new(registry);
        assert!(evaluator.evaluate(&identity("weigh-pc", Some("192.168.9.9"))).has_access);
        assert!(evaluator.evaluate(&identity("weigh-pc", None)).has_access);
    }

    #[test]
    fn substring_policy_accepts_containing_hostname() {
        let registry = registry_with(vec![NewStation::new("Gate A").with_id("S1").allow_hostname("weigh-pc")]);
        let loose = AccessEvaluator::new(Arc::clone(&registry));
        assert!(loose.evaluate(&identity("weigh-pc.yard.local", None)).has_access);
        // The allowed hostname containing the client name is not a match.
        assert!(!loose.evaluate(&identity("weigh", None)).has_access);

        let strict = AccessEvaluator::with_policy(registry, HostnameMatch::Exact);
        assert!(!strict.evaluate(&identity("weigh-pc.yard.local", None)).has_access);
        assert!(strict.evaluate(&identity("weigh-pc", None)).has_access);
    }

    #[test]
    fn no_match_denies_and_reports_allowed_ips() {
        let registry = registry_with(vec![
            NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5").allow_hostname("weigh-pc"),
            NewStation::new("Gate B").with_id("S2").allow_ip("10.0.0.6"),
        ]);
        let decision = AccessEvaluator::new(registry).evaluate(&identity("office-7", Some("10.9.9.9")));
        assert!(!decision.has_access);
        assert!(decision.station.is_none());
        assert_eq!(decision.allowed_ips, vec!["10.0.0.5", "10.0.0.6"]);
    }

    #[test]
    fn station_with_empty_lists_grants_nobody() {
        let registry = registry_with(vec![NewStation::new("Gate A").with_id("S1")]);
        let evaluator = AccessEvaluator::new(registry);
        assert!(!evaluator.evaluate(&identity("", None)).has_access);
        assert!(!evaluator.evaluate(&identity("anything", Some("10.0.0.1"))).has_access);
    }

    #[test]
    fn deactivated_station_stops_matching() {
        let registry = registry_with(vec![NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5")]);
        let evaluator = AccessEvaluator::new(Arc::clone(&registry));
        let who = identity("x", Some("10.0.0.5"));
        assert!(evaluator.evaluate(&who).has_access);

        registry.set_active("S1", false).unwrap();
        let decision = evaluator.evaluate(&who);
        assert!(!decision.has_access);
        assert!(decision.allowed_ips.is_empty());
    }

    #[test]
    fn first_registered_match_wins() {
        let registry = registry_with(vec![
            NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5"),
            NewStation::new("Gate B").with_id("S2").allow_ip("10.0.0.5"),
        ]);
        let evaluator = AccessEvaluator::new(Arc::clone(&registry));
        let who = identity("x", Some("10.0.0.5"));
        assert_eq!(evaluator.evaluate(&who).station.unwrap().id, "S1");

        registry.set_active("S1", false).unwrap();
        assert_eq!(evaluator.evaluate(&who).station.unwrap().id, "S2");
    }

    #[test]
    fn authorize_is_per_device() {
        let registry = registry_with(vec![
            NewStation::new("Gate A").with_id("S1").allow_ip("10.0.0.5"),
            NewStation::new("Gate B").with_id("S2").allow_ip("10.0.0.6"),
        ]);
        let evaluator = AccessEvaluator::new(Arc::clone(&registry));
        let who = identity("x", Some("10.0.0.5"));

        assert_eq!(evaluator.authorize(&who, "S1").unwrap().id, "S1");
        assert!(matches!(
            evaluator.authorize(&who, "S2"),
            Err(ScaleError::AccessDenied { .. })
        ));
        assert!(matches!(evaluator.authorize(&who, "S9"), Err(ScaleError::NotFound(_))));

        registry
            .update(
                "S2",
                StationPatch {
                    allowed_ips: Some(vec!["10.0.0.5".into()]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(evaluator.authorize(&who, "S2").is_ok());
    }

    #[test]
    fn policy_parses_from_str() {
        assert_eq!("Exact".parse::<HostnameMatch>().unwrap(), HostnameMatch::Exact);
        assert_eq!(" substring ".parse::<HostnameMatch>().unwrap(), HostnameMatch::Substring);
        assert!("suffix".parse::<HostnameMatch>().is_err());
    }
}
