//! Well-known identity names used by the approval policy.

/// Organization carried by every node client certificate request.
pub const NODE_ORG: &str = "system:nodes";

/// Prefix of a node's common name and username, `system:node:<nodename>`.
pub const NODE_NAME_PREFIX: &str = "system:node:";

/// Authentication group carried by bootstrap tokens.
pub const BOOTSTRAPPER_GROUP: &str = "system:bootstrappers";

/// Prefix of a bootstrapper username, `system:bootstrappers:<instance-id>`.
pub const BOOTSTRAPPER_USERNAME_PREFIX: &str = "system:bootstrappers:";

/// Authentication group for nodes requesting a master role certificate.
pub const MASTER_ROLE_GROUP: &str = "system:bootstrappers:master";

/// Authentication group for nodes requesting a worker role certificate.
pub const WORKER_ROLE_GROUP: &str = "system:bootstrappers:worker";
