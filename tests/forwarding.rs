use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dns_relay::{Config, Dispatcher, ExchangeError, QueryInfo, QueryProto};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;

// --- Mock upstream ---

struct MockUpstream {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

/// A UDP DNS server answering every A query with `answer`. With
/// `skew_id` the response id is deliberately wrong.
async fn spawn_udp_upstream(answer: [u8; 4], skew_id: bool) -> MockUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let count = requests.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            count.fetch_add(1, Ordering::SeqCst);
            let request = Message::from_vec(&buf[..n]).unwrap();

            let mut reply = Message::new();
            let id = if skew_id {
                request.id().wrapping_add(1)
            } else {
                request.id()
            };
            reply
                .set_id(id)
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_available(true)
                .add_queries(request.queries().to_vec());
            if let Some(query) = request.queries().first() {
                reply.add_answer(Record::from_rdata(
                    query.name().clone(),
                    300,
                    RData::A(A::new(answer[0], answer[1], answer[2], answer[3])),
                ));
            }
            socket
                .send_to(&reply.to_vec().unwrap(), from)
                .await
                .unwrap();
        }
    });

    MockUpstream { addr, requests }
}

fn a_query(name: &str, id: u16) -> QueryInfo {
    let mut msg = Message::new();
    msg.set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    QueryInfo::new(msg, QueryProto::Udp, 1232)
}

fn config_from(toml_str: &str) -> Config {
    let mut config: Config = toml::from_str(toml_str).unwrap();
    config.stats_log_interval_secs = 0;
    config
}

// --- Tests ---

#[tokio::test]
async fn test_forwards_matching_query() {
    let upstream = spawn_udp_upstream([1, 2, 3, 4], false).await;
    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        to = ["{}"]
        health_check_ms = 0
    "#,
        upstream.addr
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    let query = a_query("a.example.com.", 0x4242);
    let reply = dispatcher.dispatch(&query).await.expect("reply expected");

    assert_eq!(reply.id(), 0x4242);
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(
        reply.answers()[0].data(),
        &RData::A(A::new(1, 2, 3, 4))
    );
    assert_eq!(dispatcher.stats().forwarded(), 1);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_unmatched_query_falls_through() {
    let upstream = spawn_udp_upstream([1, 2, 3, 4], false).await;
    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        to = ["{}"]
        health_check_ms = 0
    "#,
        upstream.addr
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    let reply = dispatcher.dispatch(&a_query("other.net.", 1)).await;
    assert!(reply.is_none());
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.stats().matched(), 0);

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_first_matching_group_wins() {
    let specific = spawn_udp_upstream([1, 1, 1, 1], false).await;
    let broad = spawn_udp_upstream([2, 2, 2, 2], false).await;
    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        to = ["{}"]
        health_check_ms = 0

        [[groups]]
        from = ["com"]
        to = ["{}"]
        health_check_ms = 0
    "#,
        specific.addr, broad.addr
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    let reply = dispatcher
        .dispatch(&a_query("www.example.com.", 9))
        .await
        .unwrap();
    assert_eq!(reply.answers()[0].data(), &RData::A(A::new(1, 1, 1, 1)));

    let reply = dispatcher
        .dispatch(&a_query("www.elsewhere.com.", 10))
        .await
        .unwrap();
    assert_eq!(reply.answers()[0].data(), &RData::A(A::new(2, 2, 2, 2)));

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_except_names_fall_through() {
    let upstream = spawn_udp_upstream([1, 2, 3, 4], false).await;
    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        except = ["internal.example.com"]
        to = ["{}"]
        health_check_ms = 0
    "#,
        upstream.addr
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    assert!(dispatcher
        .dispatch(&a_query("www.example.com.", 1))
        .await
        .is_some());
    assert!(dispatcher
        .dispatch(&a_query("db.internal.example.com.", 2))
        .await
        .is_none());

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_out_of_order_response_is_rejected() {
    let upstream = spawn_udp_upstream([1, 2, 3, 4], true).await;
    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        to = ["{}"]
        health_check_ms = 0
    "#,
        upstream.addr
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    // Through the dispatcher the query falls through unanswered.
    assert!(dispatcher
        .dispatch(&a_query("www.example.com.", 77))
        .await
        .is_none());

    // Exchanging directly surfaces the protocol error itself.
    let group = &dispatcher.groups()[0];
    let host = group.health().select().unwrap();
    let err = host.exchange(&a_query("www.example.com.", 78)).await.unwrap_err();
    assert!(matches!(
        err,
        ExchangeError::IdMismatch { want: 78, got: 79 }
    ));

    dispatcher.stop().await;
}

#[tokio::test]
async fn test_dead_single_host_falls_through_after_probes() {
    // Nothing listens on this TCP port; probes fail with connection
    // refused, marking the lone host down after one failure.
    let placeholder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let config = config_from(&format!(
        r#"
        [[groups]]
        from = ["example.com"]
        to = ["tcp://{addr}"]
        force_tcp = true
        max_fails = 1
        health_check_ms = 1000
    "#
    ));

    let dispatcher = Dispatcher::from_config(&config).unwrap();
    dispatcher.start().await;

    // Give the initial sweep a moment to record the refused connection.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    assert!(dispatcher
        .dispatch(&a_query("www.example.com.", 5))
        .await
        .is_none());
    assert!(dispatcher.stats().health_failures() >= 1);

    dispatcher.stop().await;
}
