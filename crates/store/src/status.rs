use serde::{Deserialize, Serialize};

/// The role a store node currently holds.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum MemberState {
    /// The writable primary.
    Primary,
    /// A replicating secondary.
    Secondary,
    /// A voting non-data member.
    Arbiter,
    /// Unreachable or not replicating.
    Down,
    /// Any other state (startup, recovering, ...).
    Other,
}

/// Status of a single store node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct MemberStatus {
    /// Host address of the member.
    pub host: String,
    /// Current role.
    pub state: MemberState,
    /// Whether the member reported healthy.
    pub ok: bool,
}

/// A snapshot of the store's node set.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TopologyStatus {
    /// Name of the replicated set.
    pub set_name: String,
    /// Per-member status.
    pub members: Vec<MemberStatus>,
}

impl TopologyStatus {
    /// Hosts that are reachable and not down.
    #[must_use]
    pub fn active_hosts(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|member| member.ok && member.state != MemberState::Down)
            .map(|member| member.host.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_hosts_excludes_down_members() {
        let status = TopologyStatus {
            set_name: "rs0".into(),
            members: vec![
                MemberStatus {
                    host: "a:27017".into(),
                    state: MemberState::Primary,
                    ok: true,
                },
                MemberStatus {
                    host: "b:27017".into(),
                    state: MemberState::Down,
                    ok: false,
                },
                MemberStatus {
                    host: "c:27017".into(),
                    state: MemberState::Secondary,
                    ok: true,
                },
            ],
        };

        assert_eq!(status.active_hosts(), vec!["a:27017", "c:27017"]);
    }
}
