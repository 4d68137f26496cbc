use crate::{
    Error, Flags,
    client::{Client, Config},
    tests::util::{MockNode, init_logging},
};
use std::time::{Duration, Instant};

async fn test_client(node: &MockNode) -> Client {
    test_client_with_timeout(node, Duration::from_secs(5)).await
}

async fn test_client_with_timeout(node: &MockNode, timeout: Duration) -> Client {
    init_logging();
    let config = Config {
        server: node.url().parse().unwrap(),
        authfile: "NONE".to_owned(),
        timeout,
    };
    Client::connect_with(config).await.expect("connect to mock node")
}

#[tokio::test]
async fn put_read_get_delete_lifecycle() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("NS1", "").await.unwrap();
    client.put(ns, "k1", &b"hello"[..]).await.unwrap();

    let value = client.read(ns, "k1", Flags::Nowait).await.unwrap();
    assert_eq!(&b"hello"[..], &value);

    let value = client.get(ns, "k1", Flags::Nowait).await.unwrap();
    assert_eq!(&b"hello"[..], &value);

    // consumed: nothing left to read
    let err = client.read(ns, "k1", Flags::Nowait).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));

    client.delete_namespace(ns).await.unwrap();
    let err = client.attach_namespace("NS1").await.unwrap_err();
    assert!(matches!(err, Error::NsInvalid));
}

#[tokio::test]
async fn fifo_order_per_key() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("FIFO", "").await.unwrap();
    for value in [&b"a"[..], b"b", b"c"] {
        client.put(ns, "q", value).await.unwrap();
    }

    assert_eq!(&b"a"[..], &client.get(ns, "q", Flags::Nowait).await.unwrap());
    assert_eq!(&b"b"[..], &client.get(ns, "q", Flags::Nowait).await.unwrap());
    assert_eq!(&b"c"[..], &client.get(ns, "q", Flags::Nowait).await.unwrap());

    let err = client.get(ns, "q", Flags::Nowait).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn binary_value_round_trip() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("BIN", "").await.unwrap();
    client.put(ns, "k", &b"\x01\x00\x02"[..]).await.unwrap();

    let value = client.read(ns, "k", Flags::Nowait).await.unwrap();
    assert_eq!(3, value.len());
    assert_eq!(&b"\x01\x00\x02"[..], &value);
}

#[tokio::test]
async fn move_between_namespaces() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let src = client.create_namespace("A", "").await.unwrap();
    let dst = client.create_namespace("B", "").await.unwrap();

    client.put(src, "t", &b"v"[..]).await.unwrap();
    client.move_tuple(src, "t", dst).await.unwrap();

    assert_eq!(&b"v"[..], &client.get(dst, "t", Flags::Nowait).await.unwrap());
    let err = client.get(src, "t", Flags::Nowait).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn directory_lists_all_names() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("NS", "").await.unwrap();
    for name in ["alpha", "beta", "gamma"] {
        client.put(ns, name, &b"x"[..]).await.unwrap();
    }

    let mut names = client.directory(ns, "*").await.unwrap();
    names.sort();
    assert_eq!(vec!["alpha", "beta", "gamma"], names);
}

#[tokio::test]
async fn directory_pattern_filter() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("PAT", "").await.unwrap();
    client.put(ns, "alpha", &b"x"[..]).await.unwrap();
    client.put(ns, "beta", &b"x"[..]).await.unwrap();

    let names = client.directory(ns, "a*").await.unwrap();
    assert_eq!(vec!["alpha"], names);
}

#[tokio::test]
async fn read_is_idempotent() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("IDEM", "").await.unwrap();
    client.put(ns, "k", &b"stable"[..]).await.unwrap();

    for _ in 0..3 {
        assert_eq!(&b"stable"[..], &client.read(ns, "k", Flags::Nowait).await.unwrap());
    }
    assert_eq!(&b"stable"[..], &client.get(ns, "k", Flags::Nowait).await.unwrap());
}

#[tokio::test]
async fn namespace_metadata_query() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("META", "g1,g2").await.unwrap();
    let meta = client.query_namespace(ns).await.unwrap();
    assert_eq!("META", meta.id);
    assert_eq!(1, meta.refcnt);
    assert_eq!("g1,g2", meta.groups);
    assert_eq!(0, meta.flags);
}

#[tokio::test]
async fn attach_tracks_remote_refcount() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("REF", "").await.unwrap();
    let again = client.attach_namespace("REF").await.unwrap();
    assert_eq!(ns, again);

    let meta = client.query_namespace(ns).await.unwrap();
    assert_eq!(2, meta.refcnt);

    client.detach_namespace(again).await.unwrap();
    let meta = client.query_namespace(ns).await.unwrap();
    assert_eq!(1, meta.refcnt);
}

#[tokio::test]
async fn last_detach_removes_namespace_content() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("GONE", "").await.unwrap();
    client.put(ns, "k1", &b"v1"[..]).await.unwrap();
    client.put(ns, "k2", &b"v2"[..]).await.unwrap();
    assert!(!node.is_empty());

    client.detach_namespace(ns).await.unwrap();

    // tuples and metadata are gone, and the name cannot be attached
    assert!(node.is_empty());
    let err = client.attach_namespace("GONE").await.unwrap_err();
    assert!(matches!(err, Error::NsInvalid));
}

#[tokio::test]
async fn create_existing_namespace_fails() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    client.create_namespace("DUP", "").await.unwrap();
    let err = client.create_namespace("DUP", "").await.unwrap_err();
    assert!(matches!(err, Error::Exists));
}

#[tokio::test]
async fn remove_discards_all_values() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("RM", "").await.unwrap();
    client.put(ns, "k", &b"one"[..]).await.unwrap();
    client.put(ns, "k", &b"two"[..]).await.unwrap();

    client.remove(ns, "k").await.unwrap();
    let err = client.get(ns, "k", Flags::Nowait).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn cancellation_before_send() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("CXL", "").await.unwrap();

    // posted but never driven: the sender drops it at acquisition
    let tag = client.put_tagged(ns, "k", &b"never"[..]).await.unwrap();
    client.cancel(tag).await;

    let err = client.wait_for(tag).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // the value never reached the store
    let err = client.get(ns, "k", Flags::Nowait).await.unwrap_err();
    assert!(matches!(err, Error::Unavailable));
}

#[tokio::test]
async fn tagged_put_completes_via_test() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("TAG", "").await.unwrap();
    let tag = client.put_tagged(ns, "k", &b"v"[..]).await.unwrap();

    let mut result = None;
    for _ in 0..500 {
        if let Some(rc) = client.test(tag).await.unwrap() {
            result = Some(rc);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // RPUSH reports one stored element
    assert_eq!(Some(1), result);

    assert_eq!(&b"v"[..], &client.get(ns, "k", Flags::Nowait).await.unwrap());
}

#[tokio::test]
async fn blocking_get_times_out() {
    let node = MockNode::start().await;
    let client = test_client_with_timeout(&node, Duration::from_millis(500)).await;

    let ns = client.create_namespace("TMO", "").await.unwrap();

    let started = Instant::now();
    let err = client.get(ns, "missing", Flags::None).await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn iterator_walks_every_key() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("IT", "").await.unwrap();
    let expected: Vec<String> = (0..5).map(|i| format!("key{i}")).collect();
    for name in &expected {
        client.put(ns, name, &b"x"[..]).await.unwrap();
    }

    let mut seen = Vec::new();
    let mut handle = None;
    while let Some((next, name)) = client.iterate(ns, handle).await.unwrap() {
        seen.push(name);
        handle = Some(next);
    }

    seen.sort();
    assert_eq!(expected, seen);
}

#[tokio::test]
async fn stale_handle_is_rejected() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    let ns = client.create_namespace("STALE", "").await.unwrap();
    client.detach_namespace(ns).await.unwrap();

    let err = client.put(ns, "k", &b"v"[..]).await.unwrap_err();
    assert!(matches!(err, Error::Handle));
}

#[tokio::test]
async fn invalid_names_are_rejected_before_posting() {
    let node = MockNode::start().await;
    let client = test_client(&node).await;

    assert!(matches!(
        client.create_namespace("", "").await.unwrap_err(),
        Error::Invalid
    ));
    assert!(matches!(
        client.create_namespace("a::b", "").await.unwrap_err(),
        Error::Invalid
    ));

    let ns = client.create_namespace("OK", "").await.unwrap();
    assert!(matches!(
        client.put(ns, "", &b"v"[..]).await.unwrap_err(),
        Error::Invalid
    ));
}
