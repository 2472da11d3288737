//! `Ring` — partition-to-node mapping and local-device detection.

/// A storage device registered in the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingDevice {
    pub id: u64,
    pub device: String,
    pub ip: String,
    pub port: u16,
    pub replication_ip: String,
    pub replication_port: u16,
}

/// A device assigned to a partition; index 0 is the primary replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingNode {
    pub device: RingDevice,
    pub index: usize,
}

/// Partition mapping for the container namespace.
pub trait Ring: Send + Sync {
    fn replica_count(&self) -> usize;

    /// Every device in the ring, local or not.
    fn devs(&self) -> Vec<RingDevice>;

    fn get_part(&self, account: &str, container: &str) -> u32;

    /// Assigned nodes for a partition, primary first.
    fn get_part_nodes(&self, part: u32) -> Vec<RingNode>;
}

/// Majority of `replica_count`.
pub fn quorum_size(replica_count: usize) -> usize {
    replica_count / 2 + 1
}

/// Whether a ring device refers to this host.
pub fn is_local_device(my_ips: &[String], my_port: u16, device: &RingDevice) -> bool {
    my_ips.iter().any(|ip| *ip == device.replication_ip) && my_port == device.replication_port
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_a_majority() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn local_device_matches_on_replication_endpoint() {
        let device = RingDevice {
            id: 1,
            device: "sda".into(),
            ip: "10.0.0.1".into(),
            port: 6201,
            replication_ip: "10.0.1.1".into(),
            replication_port: 6401,
        };
        let ips = vec!["10.0.1.1".to_string()];
        assert!(is_local_device(&ips, 6401, &device));
        assert!(!is_local_device(&ips, 6201, &device));
        assert!(!is_local_device(&["10.0.9.9".to_string()], 6401, &device));
    }
}
