use std::net::TcpListener;

use streamprobe::config::{Config, TransportKind};
use streamprobe::peer::EchoPeer;
use streamprobe::runner::Runner;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_run_through_echo_peer_delivers_in_order() {
    // Reserve the benchmark's listen port, then release it for the run.
    let listen = {
        let reserved = TcpListener::bind("127.0.0.1:0").expect("bind");
        reserved.local_addr().expect("addr")
    };

    let mut cfg: Config = serde_yaml::from_str(&format!(
        r#"
transport:
  kind: tcp
  tcp:
    listen: "{listen}"
    peer: "127.0.0.1:0"
rate:
  start_hz: 2000
run:
  message_count: 200
  grace_period: 300ms
sampler:
  interval: 50ms
"#
    ))
    .expect("parse");
    assert_eq!(cfg.transport.kind, TransportKind::Tcp);

    let peer = EchoPeer::open(&cfg.transport).expect("open echo peer");
    cfg.transport.tcp.peer = peer.local_addr().expect("peer addr").to_string();

    let cancel = CancellationToken::new();
    let peer_cancel = cancel.clone();
    let peer_thread = std::thread::spawn(move || peer.run(&peer_cancel));

    let runner = Runner::new(cfg).expect("runner");
    let outcome = runner.run().await.expect("run");

    cancel.cancel();
    let stats = peer_thread.join().expect("join");

    assert_eq!(outcome.sent, 200);
    assert!(outcome.emit_error.is_none());
    assert_eq!(outcome.report.arrived.len(), 200);
    assert!(outcome.report.never_arrived.is_empty());
    assert!(outcome.report.arrived_too_late.is_empty());
    assert_eq!(outcome.report.anomalies.total(), 0);
    assert!(stats.forwarded >= 1);
}
