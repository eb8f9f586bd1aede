//! Node identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One deployed node, as returned by a strategy's deploy.
///
/// `index` is the position of the node in the deployment request so rounds
/// can assign roles by position (node 0 as coordinator, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub address: String,
    pub index: usize,
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.name, self.index, self.address)
    }
}

/// Human-readable handle of a node for logs and tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub index: usize,
    pub id: String,
    pub ip: String,
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.ip)
    }
}

impl From<&NodeInfo> for Identifier {
    fn from(node: &NodeInfo) -> Self {
        Self {
            index: node.index,
            id: node.name.clone(),
            ip: node.address.clone(),
        }
    }
}
