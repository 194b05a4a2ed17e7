use {
    crossbeam_channel::{unbounded, Receiver, Sender},
    serial_test::serial,
    std::{
        net::SocketAddr,
        sync::Arc,
        thread::sleep,
        time::{Duration, Instant},
    },
    trv1_membership::{
        connection::ConnectionState, Identity, MembershipConfig, MembershipListener,
        MembershipService,
    },
};

const MAGIC: i32 = 0x0bad_beef;

struct Inbox {
    delivered: Sender<(u16, Vec<u8>)>,
    closed: Sender<u16>,
}

impl MembershipListener for Inbox {
    fn deliver(&self, from: Identity, payload: Vec<u8>) {
        let _ = self.delivered.send((from.id(), payload));
    }

    fn link_closed(&self, peer: Identity) {
        let _ = self.closed.send(peer.id());
    }
}

struct Node {
    service: MembershipService,
    delivered: Receiver<(u16, Vec<u8>)>,
    closed: Receiver<u16>,
}

fn start_node(id: u16, seeds: Vec<SocketAddr>) -> Node {
    let config = MembershipConfig {
        magic: MAGIC,
        seeds,
        ..MembershipConfig::dev_default()
    };
    let (delivered_sender, delivered) = unbounded();
    let (closed_sender, closed) = unbounded();
    let inbox = Arc::new(Inbox {
        delivered: delivered_sender,
        closed: closed_sender,
    });
    let me = Identity::new(MAGIC, id, 1).unwrap();
    Node {
        service: MembershipService::start(config, me, inbox).unwrap(),
        delivered,
        closed,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(20));
    }
    done()
}

/// Two nodes that know each other through gossip.
fn pair() -> (Node, Node) {
    let low = start_node(1, vec![]);
    let high = start_node(2, vec![low.service.gossip_addr()]);
    assert!(wait_until(Duration::from_secs(10), || {
        low.service.view().contains(2) && high.service.view().contains(1)
    }));
    (low, high)
}

fn receive(node: &Node, count: usize) -> Vec<(u16, Vec<u8>)> {
    (0..count)
        .map(|_| node.delivered.recv_timeout(Duration::from_secs(10)).unwrap())
        .collect()
}

fn numbered(count: u32) -> Vec<Vec<u8>> {
    (0..count).map(|i| format!("message {i}").into_bytes()).collect()
}

#[test]
#[serial]
fn test_wanted_link_carries_ordered_payloads_both_ways() {
    trv1_logger::setup();
    let (low, high) = pair();
    low.service.want_link(2);
    assert!(wait_until(Duration::from_secs(10), || {
        low.service.link_state(2) == Some(ConnectionState::Established)
            && high.service.link_state(1) == Some(ConnectionState::Established)
    }));

    let to_high = high.service.identity();
    let payloads = numbered(100);
    for payload in &payloads {
        low.service.send(&to_high, payload.clone()).unwrap();
    }
    let got = receive(&high, payloads.len());
    assert!(got.iter().all(|(from, _)| *from == 1));
    assert_eq!(
        got.into_iter().map(|(_, payload)| payload).collect::<Vec<_>>(),
        payloads
    );

    let to_low = low.service.identity();
    high.service.send(&to_low, b"reply".to_vec()).unwrap();
    assert_eq!(receive(&low, 1), vec![(2, b"reply".to_vec())]);

    high.service.shutdown();
    low.service.shutdown();
}

#[test]
#[serial]
fn test_higher_id_send_opens_link_via_connect_request() {
    trv1_logger::setup();
    let (low, high) = pair();

    // the higher id cannot connect itself; it queues and asks over gossip
    let to_low = low.service.identity();
    let payloads = numbered(10);
    for payload in &payloads {
        high.service.send(&to_low, payload.clone()).unwrap();
    }
    let got: Vec<Vec<u8>> = receive(&low, payloads.len())
        .into_iter()
        .map(|(_, payload)| payload)
        .collect();
    assert_eq!(got, payloads);

    high.service.shutdown();
    low.service.shutdown();
}

#[test]
#[serial]
fn test_unwanted_link_closes_and_reopens_on_send() {
    trv1_logger::setup();
    let (low, high) = pair();
    low.service.want_link(2);
    assert!(wait_until(Duration::from_secs(10), || {
        high.service.link_state(1) == Some(ConnectionState::Established)
    }));

    low.service.unwant_link(2);
    assert!(wait_until(Duration::from_secs(10), || {
        low.service.link_state(2).is_none() && high.service.link_state(1).is_none()
    }));
    assert_eq!(low.closed.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    assert_eq!(high.closed.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    // both stay members; only the link went away
    assert!(low.service.view().contains(2));

    low.service
        .send(&high.service.identity(), b"again".to_vec())
        .unwrap();
    assert_eq!(receive(&high, 1), vec![(1, b"again".to_vec())]);

    high.service.shutdown();
    low.service.shutdown();
}

#[test]
#[serial]
fn test_send_to_self() {
    trv1_logger::setup();
    let node = start_node(3, vec![]);
    let me = node.service.identity();
    node.service.send(&me, b"one".to_vec()).unwrap();
    node.service.send(&me, b"two".to_vec()).unwrap();
    assert_eq!(
        receive(&node, 2),
        vec![(3, b"one".to_vec()), (3, b"two".to_vec())]
    );
    node.service.shutdown();
}
