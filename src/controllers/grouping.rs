use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};

use crate::models::{LABEL_CLUSTER_NAME, LABEL_NODE_ROLE};
use crate::runtime::ContainerRecord;

// One row of `k0da list`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    pub name: String,
    pub representative: ContainerRecord,
    pub nodes: usize,
}

impl ClusterSummary {
    pub fn created_display(&self) -> String {
        match Utc.timestamp_opt(self.representative.created, 0).single() {
            Some(ts) if self.representative.created > 0 => {
                ts.format("%Y-%m-%d %H:%M:%S").to_string()
            }
            _ => "-".to_string(),
        }
    }
}

// Groups container records by cluster name, sorted by name. Records without
// a cluster name label fall back to the container name.
pub fn group_clusters(records: Vec<ContainerRecord>) -> Vec<ClusterSummary> {
    let mut groups: BTreeMap<String, ClusterSummary> = BTreeMap::new();

    for record in records {
        let name = record
            .labels
            .get(LABEL_CLUSTER_NAME)
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| record.name.clone());
        let is_controller = record
            .labels
            .get(LABEL_NODE_ROLE)
            .map(|r| r == "controller")
            .unwrap_or(false);

        match groups.get_mut(&name) {
            Some(summary) => {
                summary.nodes += 1;
                let current_is_controller = summary
                    .representative
                    .labels
                    .get(LABEL_NODE_ROLE)
                    .map(|r| r == "controller")
                    .unwrap_or(false);
                if is_controller && !current_is_controller {
                    summary.representative = record;
                }
            }
            None => {
                groups.insert(
                    name.clone(),
                    ClusterSummary {
                        name,
                        representative: record,
                        nodes: 1,
                    },
                );
            }
        }
    }

    groups.into_values().collect()
}
