use serde::Serialize;

use crate::anomaly::AnomalyReport;

const HIGH_PRIORITY_CUES: [&str; 2] = ["unauthorized", "hazard"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Nominal,
    Alert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Priority {
    High,
    Low,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Recommendation {
    Monitor,
    #[serde(rename = "Investigate and report to command")]
    Investigate,
}

/// Coarse operator-facing verdict derived from an [`AnomalyReport`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub status: Status,
    pub priority: Priority,
    pub recommendation: Recommendation,
}

pub fn synthesize(report: &AnomalyReport) -> Assessment {
    let alert = report.count() > 0;
    let high = report.tags().iter().any(|tag| {
        let tag = tag.to_lowercase();
        HIGH_PRIORITY_CUES.iter().any(|cue| tag.contains(cue))
    });
    Assessment {
        status: if alert { Status::Alert } else { Status::Nominal },
        priority: if high { Priority::High } else { Priority::Low },
        recommendation: if alert {
            Recommendation::Investigate
        } else {
            Recommendation::Monitor
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hazard_is_high_priority_alert() {
        let report = AnomalyReport::from_tags(vec!["fire hazard detected".to_string()]);
        assert_eq!(
            synthesize(&report),
            Assessment {
                status: Status::Alert,
                priority: Priority::High,
                recommendation: Recommendation::Investigate,
            }
        );
    }

    #[test]
    fn nominal_report_is_monitor() {
        assert_eq!(
            synthesize(&AnomalyReport::nominal()),
            Assessment {
                status: Status::Nominal,
                priority: Priority::Low,
                recommendation: Recommendation::Monitor,
            }
        );
    }

    #[test]
    fn alert_without_cue_stays_low() {
        let report = AnomalyReport::from_tags(vec![
            "lifeboat missing".to_string(),
            "large crowd".to_string(),
        ]);
        let assessment = synthesize(&report);
        assert_eq!(assessment.status, Status::Alert);
        assert_eq!(assessment.priority, Priority::Low);
    }

    #[test]
    fn cue_match_ignores_case() {
        let report = AnomalyReport::from_tags(vec!["UNAUTHORIZED drone detected".to_string()]);
        assert_eq!(synthesize(&report).priority, Priority::High);
    }

    #[test]
    fn wire_strings() {
        let value = serde_json::to_value(synthesize(&AnomalyReport::from_tags(vec![
            "unauthorized raft movement".to_string(),
        ])))
        .unwrap();
        assert_eq!(value["status"], "Alert");
        assert_eq!(value["priority"], "High");
        assert_eq!(value["recommendation"], "Investigate and report to command");
    }
}
