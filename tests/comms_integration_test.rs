use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use trading_wire::codec::CodecRegistry;
use trading_wire::comms::{
    Ack, BroadcastPublisher, BroadcastSubscriber, ConnectionIdentity, DuplexConnection,
    HubConnection, Inbound, PeerConnection, Register,
};
use trading_wire::wire_message;

wire_message! {
    pub struct Quote {
        pub symbol: String,
        pub bid: f64,
        pub ask: f64,
    }
}

wire_message! {
    pub struct Heartbeat {
        pub sender: String,
        pub seq: i64,
    }
}

// Non-standard ports to avoid conflicts; one port per test.
const DUPLEX_PORT: u16 = 5871;
const HUB_PORT: u16 = 5872;
const BROADCAST_PORT: u16 = 5873;
const GHOST_PORT: u16 = 5874;

const SETTLE: Duration = Duration::from_millis(300);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn shared_codec() -> Arc<CodecRegistry> {
    let _ = env_logger::builder().is_test(true).try_init();
    let codec = Arc::new(CodecRegistry::new());
    codec.register::<Quote>();
    codec.register::<Heartbeat>();
    codec
}

#[test]
fn test_duplex_round_trip_stats_and_raw_fallback() -> Result<()> {
    let endpoint = format!("tcp://127.0.0.1:{DUPLEX_PORT}");
    let client_codec = shared_codec();

    // The server side only knows Quote, so a Heartbeat must surface raw.
    let server_codec = Arc::new(CodecRegistry::new());
    server_codec.register::<Quote>();

    let mut server = DuplexConnection::bind("duplex-server", &endpoint, server_codec)?;
    let client = DuplexConnection::connect("duplex-client", &endpoint, client_codec)?;

    let (tx, rx) = mpsc::channel();
    server.start_receiving(move |inbound| {
        let item = match &inbound {
            Inbound::Raw(text) => Err(text.clone()),
            _ => inbound
                .downcast_ref::<Quote>()
                .cloned()
                .ok_or_else(|| "unexpected message type".to_string()),
        };
        tx.send(item).ok();
    })?;

    // Allow ZMQ time to connect.
    thread::sleep(SETTLE);

    let quote = Quote {
        symbol: "EURUSD".to_string(),
        bid: 1.0841,
        ask: 1.0843,
    };
    client.send_reliable(&quote)?;
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT)?, Ok(quote));

    // An unregistered class is delivered as the raw frame text, not an error.
    client.send_reliable(&Heartbeat {
        sender: "client".to_string(),
        seq: 1,
    })?;
    let raw = rx.recv_timeout(RECV_TIMEOUT)?.expect_err("should be raw");
    assert!(raw.contains("Heartbeat"));

    let sent = client.stats_snapshot();
    assert_eq!(sent.sent, 2);
    assert_eq!(sent.per_class.get("Quote").map(|c| c.sent), Some(1));

    let got = server.stats_snapshot();
    assert_eq!(got.received, 1, "raw frames do not count as received");
    assert_eq!(got.receive_errors, 1);
    assert_eq!(got.per_class.get("Quote").map(|c| c.received), Some(1));

    server.stop();
    Ok(())
}

// Full many-to-one lifecycle: peers register, the hub routes by identity,
// broadcasts to everyone, receives attributed upstream messages, and forgets
// a peer after it unregisters.
#[test]
fn test_hub_registration_routing_and_unregister() -> Result<()> {
    let endpoint = format!("tcp://127.0.0.1:{HUB_PORT}");
    let codec = shared_codec();

    let mut hub = HubConnection::bind("hub", &endpoint, Arc::clone(&codec))?;
    let (up_tx, up_rx) = mpsc::channel();
    hub.start_receiving(move |identity, inbound| {
        if let Some(heartbeat) = inbound.downcast_ref::<Heartbeat>() {
            up_tx.send((identity.clone(), heartbeat.clone())).ok();
        }
    })?;

    let alpha_id = ConnectionIdentity::from("peer-alpha");
    let beta_id = ConnectionIdentity::from("peer-beta");
    let mut alpha = PeerConnection::connect(
        "peer-alpha",
        &endpoint,
        Arc::clone(&codec),
        Some(alpha_id.clone()),
    )?;
    let mut beta =
        PeerConnection::connect("peer-beta", &endpoint, codec, Some(beta_id.clone()))?;

    let (alpha_tx, alpha_rx) = mpsc::channel();
    alpha.start_receiving(move |inbound| {
        if let Some(quote) = inbound.downcast_ref::<Quote>() {
            alpha_tx.send(quote.clone()).ok();
        } else if let Some(ack) = inbound.downcast_ref::<Ack>() {
            alpha_tx
                .send(Quote {
                    symbol: format!("ack:{}", ack.status),
                    bid: 0.0,
                    ask: 0.0,
                })
                .ok();
        }
    })?;
    let (beta_tx, beta_rx) = mpsc::channel();
    beta.start_receiving(move |inbound| {
        if let Some(quote) = inbound.downcast_ref::<Quote>() {
            beta_tx.send(quote.clone()).ok();
        }
    })?;

    // Registration completes asynchronously on the receive threads.
    let deadline = Instant::now() + RECV_TIMEOUT;
    while hub.registered_peers().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(hub.registered_peers().len(), 2);

    // Each peer got the registration Ack.
    let ack = alpha_rx.recv_timeout(RECV_TIMEOUT)?;
    assert_eq!(ack.symbol, "ack:registered");

    // Targeted send reaches only the addressed peer.
    let quote = Quote {
        symbol: "GBPUSD".to_string(),
        bid: 1.27,
        ask: 1.2702,
    };
    hub.send(&beta_id, &quote)?;
    assert_eq!(beta_rx.recv_timeout(RECV_TIMEOUT)?, quote);
    assert!(alpha_rx.recv_timeout(Duration::from_millis(200)).is_err());

    // Broadcast reaches every registered peer.
    hub.broadcast(&quote)?;
    assert_eq!(alpha_rx.recv_timeout(RECV_TIMEOUT)?, quote);
    assert_eq!(beta_rx.recv_timeout(RECV_TIMEOUT)?, quote);

    // Upstream messages arrive attributed to the sending identity.
    alpha.send_reliable(&Heartbeat {
        sender: "alpha".to_string(),
        seq: 1,
    })?;
    let (from, heartbeat) = up_rx.recv_timeout(RECV_TIMEOUT)?;
    assert_eq!(from, alpha_id);
    assert_eq!(heartbeat.seq, 1);

    // Stopping a peer unregisters it at the hub.
    beta.stop();
    let deadline = Instant::now() + RECV_TIMEOUT;
    while hub.registered_peers().len() > 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(hub.registered_peers(), vec![alpha_id]);

    // A broadcast after the departure goes only to the remaining peer.
    hub.broadcast(&quote)?;
    assert_eq!(alpha_rx.recv_timeout(RECV_TIMEOUT)?, quote);

    alpha.stop();
    hub.stop();
    Ok(())
}

// A peer that dies without unregistering stays in the registry. A broadcast
// must still attempt every registered identity and reach all live peers, not
// stop at the dead one.
#[test]
fn test_broadcast_attempts_every_registered_peer() -> Result<()> {
    let endpoint = format!("tcp://127.0.0.1:{GHOST_PORT}");
    let codec = shared_codec();

    let mut hub = HubConnection::bind("ghost-hub", &endpoint, Arc::clone(&codec))?;
    hub.start_receiving(|_, _| {})?;

    // A raw dealer registers and then disconnects without an Unregister.
    {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::DEALER)?;
        socket.set_identity(b"ghost")?;
        socket.connect(&endpoint)?;
        let frame = codec.to_wire(&Register {
            identity: "ghost".to_string(),
        })?;
        socket.send(frame.as_bytes(), 0)?;

        let deadline = Instant::now() + RECV_TIMEOUT;
        while hub.registered_peers().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(hub.registered_peers().len(), 1);
    }

    let live_id = ConnectionIdentity::from("peer-live");
    let mut live = PeerConnection::connect(
        "peer-live",
        &endpoint,
        Arc::clone(&codec),
        Some(live_id.clone()),
    )?;
    let (live_tx, live_rx) = mpsc::channel();
    live.start_receiving(move |inbound| {
        if let Some(quote) = inbound.downcast_ref::<Quote>() {
            live_tx.send(quote.clone()).ok();
        }
    })?;

    let deadline = Instant::now() + RECV_TIMEOUT;
    while hub.registered_peers().len() < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(hub.registered_peers().len(), 2);

    let quote = Quote {
        symbol: "USDJPY".to_string(),
        bid: 147.21,
        ask: 147.23,
    };
    hub.broadcast(&quote)?;
    assert_eq!(live_rx.recv_timeout(RECV_TIMEOUT)?, quote);

    // Both identities were attempted, the dead one included.
    let stats = hub.stats_snapshot();
    assert_eq!(stats.per_class.get("Quote").map(|c| c.sent), Some(2));

    live.stop();
    hub.stop();
    Ok(())
}

// Topic filtering is an exact byte-prefix match on the subscriber side.
#[test]
fn test_broadcast_topic_prefix_filter() -> Result<()> {
    let endpoint = format!("tcp://127.0.0.1:{BROADCAST_PORT}");
    let codec = shared_codec();

    let publisher = BroadcastPublisher::bind("md-pub", &endpoint, Arc::clone(&codec))?;
    let mut fx_only = BroadcastSubscriber::connect(
        "fx-sub",
        &[endpoint.as_str()],
        "md.fx",
        Arc::clone(&codec),
    )?;
    let mut all_md =
        BroadcastSubscriber::connect("md-sub", &[endpoint.as_str()], "md.", codec)?;

    let (fx_tx, fx_rx) = mpsc::channel();
    fx_only.start_receiving(move |topic, inbound| {
        if let Some(quote) = inbound.downcast_ref::<Quote>() {
            fx_tx.send((topic.to_string(), quote.clone())).ok();
        }
    })?;
    let (md_tx, md_rx) = mpsc::channel();
    all_md.start_receiving(move |topic, inbound| {
        if let Some(quote) = inbound.downcast_ref::<Quote>() {
            md_tx.send((topic.to_string(), quote.clone())).ok();
        }
    })?;

    // Slow-joiner settle: frames published before the subscriptions land
    // are silently missed.
    thread::sleep(SETTLE);

    let fx_quote = Quote {
        symbol: "EURUSD".to_string(),
        bid: 1.0841,
        ask: 1.0843,
    };
    let eq_quote = Quote {
        symbol: "AAPL".to_string(),
        bid: 189.10,
        ask: 189.12,
    };
    publisher.publish("md.fx.eurusd", &fx_quote)?;
    publisher.publish("md.eq.aapl", &eq_quote)?;

    // The broad subscriber sees both topics, in publication order.
    assert_eq!(
        md_rx.recv_timeout(RECV_TIMEOUT)?,
        ("md.fx.eurusd".to_string(), fx_quote.clone())
    );
    assert_eq!(
        md_rx.recv_timeout(RECV_TIMEOUT)?,
        ("md.eq.aapl".to_string(), eq_quote)
    );

    // The narrow subscriber sees only the matching prefix.
    assert_eq!(
        fx_rx.recv_timeout(RECV_TIMEOUT)?,
        ("md.fx.eurusd".to_string(), fx_quote)
    );
    assert!(fx_rx.recv_timeout(Duration::from_millis(200)).is_err());

    fx_only.stop();
    all_md.stop();
    Ok(())
}
