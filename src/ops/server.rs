//! Server records: the nodes participating in an operation.

use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    Node,
}

impl std::fmt::Display for ServerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Node => f.write_str("node"),
        }
    }
}

/// A cluster node as recorded in an operation plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub advertise_ip: String,
    pub hostname: String,
    pub node_id: String,
    pub instance_id: String,
    pub role: ServerRole,
}

impl Server {
    pub fn new(advertise_ip: &str, hostname: &str, role: ServerRole) -> Self {
        Self {
            advertise_ip: advertise_ip.to_string(),
            hostname: hostname.to_string(),
            node_id: hostname.to_string(),
            instance_id: String::new(),
            role,
        }
    }

    pub fn with_ids(mut self, node_id: &str, instance_id: &str) -> Self {
        self.node_id = node_id.to_string();
        self.instance_id = instance_id.to_string();
        self
    }

    /// Identity match against any of the stable identifiers, case-sensitive.
    pub fn matches(&self, token: &str) -> bool {
        token == self.advertise_ip
            || token == self.hostname
            || token == self.node_id
            || token == self.instance_id
    }

    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.hostname, self.advertise_ip)
    }
}

/// Find a server in a roster by identity token.
pub fn find_server<'a>(servers: &'a [Server], token: &str) -> Option<&'a Server> {
    servers.iter().find(|s| s.matches(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new("10.0.0.5", "node-1", ServerRole::Master).with_ids("nid-1", "i-abc123")
    }

    #[test]
    fn matches_any_identifier() {
        let s = server();
        assert!(s.matches("10.0.0.5"));
        assert!(s.matches("node-1"));
        assert!(s.matches("nid-1"));
        assert!(s.matches("i-abc123"));
        assert!(!s.matches("node-2"));
    }

    #[test]
    fn match_is_case_sensitive() {
        let s = server();
        assert!(!s.matches("NODE-1"));
    }

    #[test]
    fn find_in_roster() {
        let roster = vec![
            server(),
            Server::new("10.0.0.6", "node-2", ServerRole::Node),
        ];
        assert_eq!(find_server(&roster, "node-2").unwrap().advertise_ip, "10.0.0.6");
        assert!(find_server(&roster, "node-9").is_none());
    }
}
