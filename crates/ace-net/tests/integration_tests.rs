use std::collections::HashMap;

use ace_net::{PortAllocator, PortRange};

#[tokio::test]
async fn port_accounting_has_no_leak_after_release() {
    let mut ranges = HashMap::new();
    ranges.insert("vpn1".to_string(), PortRange { lo: 40000, hi: 40009 });
    ranges.insert("vpn2".to_string(), PortRange { lo: 41000, hi: 41009 });
    let allocator = PortAllocator::new(ranges, 20);

    let mut reserved = Vec::new();
    for _ in 0..5 {
        reserved.push(allocator.reserve("vpn1").await.unwrap());
    }
    for _ in 0..5 {
        reserved.push(allocator.reserve("vpn2").await.unwrap());
    }
    assert_eq!(allocator.total_reserved().await, 10);

    for port in &reserved[..5] {
        allocator.release("vpn1", *port).await;
    }
    assert_eq!(allocator.total_reserved().await, 5);
}

#[tokio::test]
async fn cap_blocks_new_reservations_across_vpns() {
    let mut ranges = HashMap::new();
    ranges.insert("vpn1".to_string(), PortRange { lo: 40000, hi: 40009 });
    ranges.insert("vpn2".to_string(), PortRange { lo: 41000, hi: 41009 });
    let allocator = PortAllocator::new(ranges, 2);

    allocator.reserve("vpn1").await.unwrap();
    allocator.reserve("vpn2").await.unwrap();
    let result = allocator.reserve("vpn1").await;
    assert!(result.is_err());
}
