//! Shared vocabulary for knockgate: knock rules, sequences, and their
//! wire/store representations.
//!
//! Rule records are produced by the external management layer and consumed
//! read-only here. The compact sequence syntax (`"1201:TCP,2301:UDP"`) and
//! the MD5-derived rule identifier are part of that external contract and
//! must stay bit-compatible with existing stores.

use std::{error::Error, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// Transport protocol of a single knock step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(ConfigError::InvalidProtocol(other.to_string())),
        }
    }
}

/// One step of a knock sequence: a destination port plus the transport
/// protocol the client must use to hit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KnockStep {
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Display for KnockStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.port, self.protocol)
    }
}

/// Ordered, non-empty knock sequence.
///
/// The canonical wire form is the store's compact string, e.g.
/// `"1201:TCP,2301:UDP,3401:TCP"`; parsing and rendering round-trip
/// through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockSequence(Vec<KnockStep>);

impl KnockSequence {
    /// Build a sequence from already-validated steps. An empty step list is
    /// rejected: a rule with nothing to knock can never authenticate anyone.
    pub fn new(steps: Vec<KnockStep>) -> Result<Self, ConfigError> {
        if steps.is_empty() {
            return Err(ConfigError::EmptySequence);
        }
        Ok(KnockSequence(steps))
    }

    pub fn steps(&self) -> &[KnockStep] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First step of the sequence, the only packet that may open a session.
    pub fn first(&self) -> KnockStep {
        self.0[0]
    }

    /// Distinct ports referenced by the sequence, in first-occurrence order.
    /// This is the port set the capture filter is built from.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for step in &self.0 {
            if !ports.contains(&step.port) {
                ports.push(step.port);
            }
        }
        ports
    }

    /// Normalized form used for rule identity, e.g.
    /// `"1201_TCP-2301_UDP-3401_TCP"`. Matches the store's historical id
    /// derivation exactly.
    pub fn normalized(&self) -> String {
        self.to_string().replace(':', "_").replace(',', "-")
    }
}

impl fmt::Display for KnockSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

impl FromStr for KnockSequence {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ConfigError::EmptySequence);
        }

        let mut steps = Vec::new();
        for item in s.split(',') {
            let item = item.trim();
            let (port_str, proto_str) = item
                .split_once(':')
                .ok_or_else(|| ConfigError::MalformedStep(item.to_string()))?;

            let port: u16 = port_str
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port_str.trim().to_string()))?;
            if port == 0 {
                return Err(ConfigError::InvalidPort(port_str.trim().to_string()));
            }

            steps.push(KnockStep {
                port,
                protocol: proto_str.parse()?,
            });
        }

        KnockSequence::new(steps)
    }
}

impl Serialize for KnockSequence {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KnockSequence {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Rule state as stored by the management layer: `"1"` enabled, `"0"`
/// disabled. Carried as data; the supervisor does not interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleStatus {
    Disabled,
    #[default]
    Enabled,
}

impl Serialize for RuleStatus {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(match self {
            RuleStatus::Disabled => "0",
            RuleStatus::Enabled => "1",
        })
    }
}

impl<'de> Deserialize<'de> for RuleStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match String::deserialize(deserializer)?.as_str() {
            "0" => Ok(RuleStatus::Disabled),
            "1" => Ok(RuleStatus::Enabled),
            other => Err(de::Error::custom(format!("unknown rule status: {other}"))),
        }
    }
}

fn default_zone() -> String {
    "public".to_string()
}

/// A port-knocking rule as consumed from the rule store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnockRule {
    /// Ordered knock steps the client must reproduce.
    pub port_sequence: KnockSequence,
    /// Port opened for the client after successful authentication.
    pub target_port: u16,
    /// Maximum seconds allowed between consecutive valid steps.
    pub time_window: u64,
    /// Lifetime in seconds of a firewall grant before auto-revocation.
    pub timeout: u64,
    /// Expected payload of the final knock packet, compared byte-for-byte.
    pub password_hash: String,
    /// Firewall zone the grant is applied within.
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default)]
    pub status: RuleStatus,
}

impl KnockRule {
    /// Stable rule identifier: MD5 of the normalized sequence plus target
    /// port (`"1201_TCP-2301_UDP-3401_TCP_22"`). Bit-compatible with the
    /// ids the management layer already persists.
    pub fn id(&self) -> String {
        let key = format!("{}_{}", self.port_sequence.normalized(), self.target_port);
        format!("{:x}", md5::compute(key))
    }

    /// Check the field constraints the store is supposed to uphold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_port == 0 {
            return Err(ConfigError::InvalidPort("0".to_string()));
        }
        if self.time_window == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.password_hash.is_empty() {
            return Err(ConfigError::EmptyPasswordHash);
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    EmptySequence,
    MalformedStep(String),
    InvalidPort(String),
    InvalidProtocol(String),
    ZeroWindow,
    ZeroTimeout,
    EmptyPasswordHash,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptySequence => write!(f, "knock sequence must not be empty"),
            ConfigError::MalformedStep(item) => {
                write!(f, "malformed knock step '{item}', expected 'port:protocol'")
            }
            ConfigError::InvalidPort(port) => {
                write!(f, "invalid port '{port}', expected 1-65535")
            }
            ConfigError::InvalidProtocol(proto) => {
                write!(f, "unsupported protocol '{proto}', expected TCP or UDP")
            }
            ConfigError::ZeroWindow => write!(f, "time window must be greater than zero"),
            ConfigError::ZeroTimeout => write!(f, "timeout must be greater than zero"),
            ConfigError::EmptyPasswordHash => write!(f, "password hash must not be empty"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(sequence: &str, target_port: u16) -> KnockRule {
        KnockRule {
            port_sequence: sequence.parse().expect("test sequence parses"),
            target_port,
            time_window: 10,
            timeout: 30,
            password_hash: "5ebe2294ecd0e0f08eab7690d2a6ee69".to_string(),
            zone: "public".to_string(),
            status: RuleStatus::Enabled,
        }
    }

    #[test]
    fn parses_mixed_sequence() {
        let seq: KnockSequence = "1201:TCP,2301:UDP,3401:TCP".parse().unwrap();
        assert_eq!(seq.len(), 3);
        assert_eq!(
            seq.steps()[1],
            KnockStep {
                port: 2301,
                protocol: Protocol::Udp
            }
        );
    }

    #[test]
    fn display_round_trips() {
        let raw = "1201:TCP,2301:UDP,3401:TCP";
        let seq: KnockSequence = raw.parse().unwrap();
        assert_eq!(seq.to_string(), raw);
    }

    #[test]
    fn parse_tolerates_case_and_whitespace() {
        let seq: KnockSequence = " 1201:tcp , 2301:Udp ".parse().unwrap();
        assert_eq!(seq.first().protocol, Protocol::Tcp);
        assert_eq!(seq.steps()[1].protocol, Protocol::Udp);
    }

    #[test]
    fn rejects_empty_sequence() {
        assert_eq!(
            "".parse::<KnockSequence>().unwrap_err(),
            ConfigError::EmptySequence
        );
        assert_eq!(
            "   ".parse::<KnockSequence>().unwrap_err(),
            ConfigError::EmptySequence
        );
    }

    #[test]
    fn rejects_missing_protocol() {
        assert_eq!(
            "1201".parse::<KnockSequence>().unwrap_err(),
            ConfigError::MalformedStep("1201".to_string())
        );
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert_eq!(
            "1201:ICMP".parse::<KnockSequence>().unwrap_err(),
            ConfigError::InvalidProtocol("ICMP".to_string())
        );
    }

    #[test]
    fn rejects_out_of_range_ports() {
        assert_eq!(
            "0:TCP".parse::<KnockSequence>().unwrap_err(),
            ConfigError::InvalidPort("0".to_string())
        );
        assert_eq!(
            "70000:TCP".parse::<KnockSequence>().unwrap_err(),
            ConfigError::InvalidPort("70000".to_string())
        );
    }

    #[test]
    fn ports_dedup_in_first_occurrence_order() {
        let seq: KnockSequence = "3401:TCP,1201:UDP,3401:UDP,1201:TCP".parse().unwrap();
        assert_eq!(seq.ports(), vec![3401, 1201]);
    }

    #[test]
    fn normalized_matches_store_format() {
        let seq: KnockSequence = "1201:TCP,2301:UDP,3401:TCP".parse().unwrap();
        assert_eq!(seq.normalized(), "1201_TCP-2301_UDP-3401_TCP");
    }

    #[test]
    fn rule_id_matches_store_derivation() {
        // MD5("1201_TCP-2301_UDP-3401_TCP_22")
        let rule = rule("1201:TCP,2301:UDP,3401:TCP", 22);
        assert_eq!(rule.id(), "c31ce0e425fa657c0d73ea7e894d668a");
    }

    #[test]
    fn rule_id_is_stable_across_clones() {
        let rule = rule("9000:UDP", 22);
        assert_eq!(rule.id(), rule.clone().id());
    }

    #[test]
    fn rule_deserializes_from_store_json() {
        let rule: KnockRule = serde_json::from_str(
            r#"{
                "id": "ignored-by-consumers",
                "portSequence": "1201:TCP,2301:UDP,3401:TCP",
                "targetPort": 22,
                "timeWindow": 10,
                "timeout": 30,
                "passwordHash": "5ebe2294ecd0e0f08eab7690d2a6ee69",
                "status": "1"
            }"#,
        )
        .unwrap();

        assert_eq!(rule.port_sequence.len(), 3);
        assert_eq!(rule.target_port, 22);
        assert_eq!(rule.zone, "public");
        assert_eq!(rule.status, RuleStatus::Enabled);
    }

    #[test]
    fn rule_serializes_with_store_field_names() {
        let json = serde_json::to_value(rule("1201:TCP", 22)).unwrap();
        assert_eq!(json["portSequence"], "1201:TCP");
        assert_eq!(json["targetPort"], 22);
        assert_eq!(json["status"], "1");
    }

    #[test]
    fn validate_rejects_bad_fields() {
        let mut bad = rule("1201:TCP", 22);
        bad.time_window = 0;
        assert_eq!(bad.validate().unwrap_err(), ConfigError::ZeroWindow);

        let mut bad = rule("1201:TCP", 22);
        bad.timeout = 0;
        assert_eq!(bad.validate().unwrap_err(), ConfigError::ZeroTimeout);

        let mut bad = rule("1201:TCP", 22);
        bad.password_hash.clear();
        assert_eq!(bad.validate().unwrap_err(), ConfigError::EmptyPasswordHash);

        let mut bad = rule("1201:TCP", 22);
        bad.target_port = 0;
        assert!(matches!(
            bad.validate().unwrap_err(),
            ConfigError::InvalidPort(_)
        ));
    }

    #[test]
    fn validate_accepts_well_formed_rule() {
        assert!(rule("1201:TCP,2301:UDP,3401:TCP", 22).validate().is_ok());
    }
}
