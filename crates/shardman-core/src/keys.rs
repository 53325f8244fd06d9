//! Consistent-store key layout.
//!
//! All coordination state for one service lives under a common prefix:
//! the single-slot task buffer, the bridge/guard lease carriers and the
//! per-container session keys.

const ROOT: &str = "/sm/app";

/// Single-slot command buffer; empty string means idle.
pub fn task(service: &str) -> String {
    format!("{ROOT}/{service}/task")
}

/// Prefix covering the bridge, guard and session keys of a service.
pub fn lease_prefix(service: &str) -> String {
    format!("{ROOT}/{service}/lease/")
}

/// Transient lease carrier created at round start, deleted at round end.
pub fn lease_bridge(service: &str) -> String {
    format!("{ROOT}/{service}/lease/bridge")
}

/// Steady-state lease carrier, modified once per round.
pub fn lease_guard(service: &str) -> String {
    format!("{ROOT}/{service}/lease/guard")
}

/// Prefix of the per-container liveness keys.
pub fn session_prefix(service: &str) -> String {
    format!("{ROOT}/{service}/lease/session/")
}

/// Liveness key of one container, bound to the guard lease.
pub fn session(service: &str, container_id: &str) -> String {
    format!("{ROOT}/{service}/lease/session/{container_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_keys_share_the_watch_prefix() {
        let prefix = lease_prefix("orders");
        assert!(lease_bridge("orders").starts_with(&prefix));
        assert!(lease_guard("orders").starts_with(&prefix));
        assert!(session("orders", "c1").starts_with(&prefix));
        assert!(!task("orders").starts_with(&prefix));
    }

    #[test]
    fn session_namespace_is_disjoint_from_bridge_and_guard() {
        // Exact-match dispatch for bridge/guard must never shadow a
        // session key and vice versa.
        let sess = session("orders", "c1");
        assert!(sess.starts_with(&session_prefix("orders")));
        assert!(!lease_bridge("orders").starts_with(&session_prefix("orders")));
        assert!(!lease_guard("orders").starts_with(&session_prefix("orders")));
        assert_ne!(sess, lease_bridge("orders"));
        assert_ne!(sess, lease_guard("orders"));
    }
}
