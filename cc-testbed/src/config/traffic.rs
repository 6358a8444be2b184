//! Traffic descriptor parsing
//!
//! The descriptor is a JSON document with a `flows` array. Each entry is a positional tuple
//! `[src, dst, _, _, start, end, tag, directive]`: entries with a null directive are flows, the
//! others are link emulation directives that turn into [`Change`]s.

use crate::config::ConfigError;
use anyhow::Context;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;
use testbed_network::tcp::congestion;

const TBF_BANDWIDTH_PARAM: usize = 1;
const NETEM_DELAY_PARAM: usize = 2;
const NETEM_LOSS_PARAM: usize = 6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Flow {
    pub src: String,
    pub dst: String,
    /// Start time, in simulated seconds
    pub start: u64,
    /// Time at which the sender stops, in simulated seconds
    pub end: u64,
    /// Name of the congestion control implementation, e.g. `TcpCubic`
    pub congestion_control: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// New bottleneck data rate, in Mbps
    Bandwidth,
    /// New round-trip delay of the access links, in milliseconds
    Delay,
    /// New packet loss probability of the bottleneck
    Loss,
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Bandwidth => write!(f, "bandwidth"),
            ChangeKind::Delay => write!(f, "delay"),
            ChangeKind::Loss => write!(f, "loss"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Change {
    /// Simulated time at which the change is applied, in seconds
    pub time: f64,
    pub kind: ChangeKind,
    pub value: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExperimentConfig {
    pub flows: Vec<Flow>,
    pub changes: Vec<Change>,
}

#[derive(Deserialize)]
struct TrafficJson {
    flows: Vec<FlowEntryJson>,
}

#[derive(Deserialize)]
struct FlowEntryJson(
    String,
    String,
    IgnoredAny,
    IgnoredAny,
    u64,
    u64,
    String,
    Option<serde_json::Value>,
);

impl ExperimentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read traffic descriptor at {}", path.display()))?;
        let config = Self::parse(&json)
            .with_context(|| format!("invalid traffic descriptor at {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let traffic: TrafficJson = serde_json::from_str(json)?;
        let mut config = ExperimentConfig::default();

        for (entry, FlowEntryJson(src, dst, _, _, start, end, tag, directive)) in
            traffic.flows.into_iter().enumerate()
        {
            match directive {
                None => {
                    if start > end {
                        return Err(ConfigError::InvalidFlowWindow { entry, start, end });
                    }

                    let congestion_control = implementation_name(&tag);
                    if congestion::by_name(&congestion_control).is_none() {
                        return Err(ConfigError::UnknownCongestionControl {
                            entry,
                            name: congestion_control,
                            known: congestion::REGISTERED.join(", "),
                        });
                    }

                    config.flows.push(Flow {
                        src,
                        dst,
                        start,
                        end,
                        congestion_control,
                    });
                }
                Some(directive) => {
                    let time = start as f64;
                    match tag.as_str() {
                        "tbf" => {
                            let value =
                                directive_number(&directive, entry, "tbf", TBF_BANDWIDTH_PARAM)?;
                            config.push_change(entry, time, ChangeKind::Bandwidth, value)?;
                        }
                        "netem" => {
                            let delay =
                                directive_number(&directive, entry, "netem", NETEM_DELAY_PARAM)?;
                            let loss = match directive.get(NETEM_LOSS_PARAM) {
                                None | Some(serde_json::Value::Null) => 0.0,
                                Some(_) => {
                                    directive_number(&directive, entry, "netem", NETEM_LOSS_PARAM)?
                                }
                            };
                            config.push_change(entry, time, ChangeKind::Delay, delay)?;
                            config.push_change(entry, time, ChangeKind::Loss, loss)?;
                        }
                        other => {
                            tracing::debug!(
                                entry,
                                tag = other,
                                "ignoring unrecognized emulation directive"
                            );
                        }
                    }
                }
            }
        }

        Ok(config)
    }

    /// The time at which the experiment ends: the latest flow end time
    pub fn stop_time(&self) -> u64 {
        self.flows.iter().map(|f| f.end).max().unwrap_or(0)
    }

    fn push_change(
        &mut self,
        entry: usize,
        time: f64,
        kind: ChangeKind,
        value: f64,
    ) -> Result<(), ConfigError> {
        let out_of_range = |reason| ConfigError::ChangeOutOfRange {
            entry,
            kind,
            value,
            reason,
        };

        match kind {
            ChangeKind::Bandwidth if value <= 0.0 => return Err(out_of_range("must be positive")),
            ChangeKind::Delay if value < 0.0 => return Err(out_of_range("must not be negative")),
            ChangeKind::Loss if !(0.0..=1.0).contains(&value) => {
                return Err(out_of_range("must be a probability"));
            }
            _ => {}
        }

        self.changes.push(Change { time, kind, value });
        Ok(())
    }
}

/// Maps a short tag like `cubic` to its implementation name, `TcpCubic`
fn implementation_name(tag: &str) -> String {
    let mut chars = tag.chars();
    match chars.next() {
        Some(first) => format!("Tcp{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => "Tcp".to_string(),
    }
}

fn directive_number(
    directive: &serde_json::Value,
    entry: usize,
    tag: &'static str,
    index: usize,
) -> Result<f64, ConfigError> {
    directive
        .get(index)
        .and_then(|v| v.as_f64())
        .filter(|v| v.is_finite())
        .ok_or(ConfigError::DirectiveParameter { entry, tag, index })
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(flows: &str) -> Result<ExperimentConfig, ConfigError> {
        ExperimentConfig::parse(&format!(r#"{{ "flows": [{flows}] }}"#))
    }

    #[test]
    fn test_single_cubic_flow() {
        let config = parse(r#"["h1", "h2", 0, 0, 0, 40, "cubic", null]"#).unwrap();

        assert_eq!(
            config.flows,
            vec![Flow {
                src: "h1".to_string(),
                dst: "h2".to_string(),
                start: 0,
                end: 40,
                congestion_control: "TcpCubic".to_string(),
            }]
        );
        assert!(config.changes.is_empty());
        assert_eq!(config.stop_time(), 40);
    }

    #[test]
    fn test_tbf_directive_yields_bandwidth_change() {
        let config =
            parse(r#"["r1", "r2", 0, 0, 10, 0, "tbf", ["root", 20, "32kbit", 70]]"#).unwrap();

        assert!(config.flows.is_empty());
        assert_eq!(
            config.changes,
            vec![Change {
                time: 10.0,
                kind: ChangeKind::Bandwidth,
                value: 20.0,
            }]
        );
    }

    #[test]
    fn test_netem_directive_yields_delay_and_loss() {
        let config = parse(
            r#"["r1", "r2", 0, 0, 5, 0, "netem", [null, null, 30, null, null, null, 0.02]]"#,
        )
        .unwrap();
        assert_eq!(
            config.changes,
            vec![
                Change {
                    time: 5.0,
                    kind: ChangeKind::Delay,
                    value: 30.0,
                },
                Change {
                    time: 5.0,
                    kind: ChangeKind::Loss,
                    value: 0.02,
                },
            ]
        );
    }

    #[test]
    fn test_netem_without_loss_defaults_to_zero() {
        let config = parse(
            r#"["r1", "r2", 0, 0, 5, 0, "netem", [null, null, 30, null, null, null, null]]"#,
        )
        .unwrap();
        assert_eq!(config.changes[1].kind, ChangeKind::Loss);
        assert_eq!(config.changes[1].value, 0.0);

        let config = parse(r#"["r1", "r2", 0, 0, 5, 0, "netem", [null, null, 30]]"#).unwrap();
        assert_eq!(config.changes[1].value, 0.0);
    }

    #[test]
    fn test_unrecognized_directive_is_ignored() {
        let config = parse(
            r#"["h1", "h2", 0, 0, 0, 30, "scalable", null],
               ["r1", "r2", 0, 0, 5, 0, "htb", {"rate": 10}]"#,
        )
        .unwrap();

        assert_eq!(config.flows.len(), 1);
        assert_eq!(config.flows[0].congestion_control, "TcpScalable");
        assert!(config.changes.is_empty());
    }

    #[test]
    fn test_entry_order_is_preserved() {
        let config = parse(
            r#"["h1", "h2", 0, 0, 0, 30, "newReno", null],
               ["h3", "h4", 0, 0, 10, 50, "scalable", null],
               ["h5", "h6", 0, 0, 5, 20, "cubic", null]"#,
        )
        .unwrap();

        let names: Vec<_> = config.flows.iter().map(|f| f.congestion_control.as_str()).collect();
        assert_eq!(names, ["TcpNewReno", "TcpScalable", "TcpCubic"]);
        assert_eq!(config.stop_time(), 50);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let doc = r#"["h1", "h2", 0, 0, 0, 30, "cubic", null],
                     ["r1", "r2", 0, 0, 5, 0, "netem", [null, null, 30, null, null, null, 0.1]]"#;
        assert_eq!(parse(doc).unwrap(), parse(doc).unwrap());
    }

    #[test]
    fn test_malformed_documents_are_rejected() {
        // Missing flows key
        assert!(matches!(
            ExperimentConfig::parse(r#"{ "links": [] }"#),
            Err(ConfigError::Malformed(_))
        ));

        // Wrong arity
        assert!(matches!(
            parse(r#"["h1", "h2", 0, 0, 0, 30, "cubic"]"#),
            Err(ConfigError::Malformed(_))
        ));
        assert!(matches!(
            parse(r#"["h1", "h2", 0, 0, 0, 30, "cubic", null, 1]"#),
            Err(ConfigError::Malformed(_))
        ));

        // Non-numeric start time
        assert!(matches!(
            parse(r#"["h1", "h2", 0, 0, "now", 30, "cubic", null]"#),
            Err(ConfigError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_flows_and_directives_are_rejected() {
        assert!(matches!(
            parse(r#"["h1", "h2", 0, 0, 0, 30, "bbr9000", null]"#),
            Err(ConfigError::UnknownCongestionControl { .. })
        ));
        assert!(matches!(
            parse(r#"["h1", "h2", 0, 0, 40, 30, "cubic", null]"#),
            Err(ConfigError::InvalidFlowWindow { entry: 0, .. })
        ));
        assert!(matches!(
            parse(r#"["r1", "r2", 0, 0, 5, 0, "tbf", ["root", "fast"]]"#),
            Err(ConfigError::DirectiveParameter { tag: "tbf", index: 1, .. })
        ));
        assert!(matches!(
            parse(r#"["r1", "r2", 0, 0, 5, 0, "netem", [null, null, 30, null, null, null, 1.5]]"#),
            Err(ConfigError::ChangeOutOfRange { kind: ChangeKind::Loss, .. })
        ));
    }
}
