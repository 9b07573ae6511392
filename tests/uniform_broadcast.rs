//! Uniform reliable broadcast across in-process node groups on loopback.

use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use argonaut::broadcast::UniformReliableBroadcast;
use argonaut::core::Membership;
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

type Deliveries = Arc<Mutex<Vec<(u8, u32, u32)>>>;

fn group(base: u16, n: u8) -> Membership {
    let addrs: HashMap<u8, SocketAddr> = (1..=n)
        .map(|id| (id, SocketAddr::from(([127, 0, 0, 1], base + id as u16))))
        .collect();
    Membership::new(addrs)
}

async fn start_node(id: u8, membership: &Membership) -> (Arc<UniformReliableBroadcast>, Deliveries) {
    let urb = Arc::new(UniformReliableBroadcast::new(id, membership.clone()));
    urb.bind(membership.addr_of(id).unwrap()).await.unwrap();

    let deliveries: Deliveries = Arc::default();
    {
        let urb = Arc::clone(&urb);
        let deliveries = Arc::clone(&deliveries);
        tokio::spawn(async move {
            urb.listen(move |origin, seq_nr, payload| {
                let value = u32::from_le_bytes(payload.try_into().expect("u32 payload"));
                deliveries.lock().push((origin, seq_nr, value));
            })
            .await
            .unwrap();
        });
    }
    (urb, deliveries)
}

async fn wait_for_count(deliveries: &Deliveries, expected: usize, secs: u64) {
    timeout(Duration::from_secs(secs), async {
        loop {
            if deliveries.lock().len() >= expected {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "timed out with {} of {expected} deliveries",
            deliveries.lock().len()
        )
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn every_node_delivers_every_broadcast_once() {
    let membership = group(41110, 3);
    let mut nodes = Vec::new();
    for id in 1..=3 {
        nodes.push(start_node(id, &membership).await);
    }

    for (urb, _) in &nodes {
        let value = urb.id() as u32 * 100;
        urb.broadcast(&[&value.to_le_bytes()]).await.unwrap();
    }

    for (_, deliveries) in &nodes {
        wait_for_count(deliveries, 3, 30).await;
    }
    sleep(Duration::from_millis(500)).await;

    let expected: HashSet<(u8, u32)> = [(1, 100), (2, 200), (3, 300)].into();
    for (urb, deliveries) in &nodes {
        let deliveries = deliveries.lock();
        assert_eq!(deliveries.len(), 3, "node {} over-delivered", urb.id());
        let seen: HashSet<(u8, u32)> = deliveries.iter().map(|&(o, _, v)| (o, v)).collect();
        assert_eq!(seen, expected, "node {} delivered wrong set", urb.id());
    }

    for (urb, _) in &nodes {
        urb.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn correct_majority_delivers_despite_silent_node() {
    // Node 3 is in the membership but never comes up.
    let membership = group(41210, 3);
    let alive = [
        start_node(1, &membership).await,
        start_node(2, &membership).await,
    ];

    for (urb, _) in &alive {
        let value = urb.id() as u32;
        urb.broadcast(&[&value.to_le_bytes()]).await.unwrap();
    }

    for (_, deliveries) in &alive {
        wait_for_count(deliveries, 2, 30).await;
    }
    sleep(Duration::from_millis(500)).await;

    for (urb, deliveries) in &alive {
        let deliveries = deliveries.lock();
        let seen: HashSet<(u8, u32)> = deliveries.iter().map(|&(o, _, v)| (o, v)).collect();
        assert_eq!(seen, HashSet::from([(1, 1), (2, 2)]));
        assert!(
            deliveries.iter().all(|&(origin, _, _)| origin != 3),
            "node {} delivered from the dead node",
            urb.id()
        );
    }

    for (urb, _) in &alive {
        urb.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn packed_chunks_deliver_in_datagram_order() {
    let membership = group(41310, 3);
    let mut nodes = Vec::new();
    for id in 1..=3 {
        nodes.push(start_node(id, &membership).await);
    }

    let values = [11u32, 22, 33];
    let encoded: Vec<[u8; 4]> = values.iter().map(|v| v.to_le_bytes()).collect();
    let chunks: Vec<&[u8]> = encoded.iter().map(|b| b.as_slice()).collect();
    nodes[0].0.broadcast(&chunks).await.unwrap();

    for (_, deliveries) in &nodes {
        wait_for_count(deliveries, 3, 30).await;
    }

    for (urb, deliveries) in &nodes {
        let deliveries = deliveries.lock();
        let (origins, seqs, got): (Vec<u8>, HashSet<u32>, Vec<u32>) = (
            deliveries.iter().map(|d| d.0).collect(),
            deliveries.iter().map(|d| d.1).collect(),
            deliveries.iter().map(|d| d.2).collect(),
        );
        assert_eq!(origins, [1, 1, 1]);
        assert_eq!(seqs.len(), 1, "chunks of one datagram share a seq_nr");
        assert_eq!(got, values, "node {} chunk order broken", urb.id());
    }

    for (urb, _) in &nodes {
        urb.shutdown();
    }
}
