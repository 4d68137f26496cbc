use crate::{
    network::hash_slot,
    resp::{Value, ValueDecoder},
};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::FramedRead;

/// In-process Redis stand-in speaking the command subset the engine
/// issues. Each node owns a slot range and its own store; keys hashing
/// outside the range are answered with `MOVED` pointing at the owning
/// peer, like a real cluster node.
pub(crate) struct MockNode {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

struct Shared {
    store: Mutex<Store>,
    /// slots this node owns
    slot_range: (u16, u16),
    /// (first, last, master + replicas) advertised through CLUSTER SLOTS
    shards: Mutex<Vec<(u16, u16, Vec<SocketAddr>)>>,
    /// (first, last, addr) used as MOVED redirection targets; normally the
    /// shard masters, but tests may advertise a stale topology
    moved_peers: Mutex<Vec<(u16, u16, SocketAddr)>>,
    cluster_enabled: bool,
    password: Option<String>,
}

#[derive(Default)]
struct Store {
    lists: HashMap<Vec<u8>, VecDeque<Bytes>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
}

impl MockNode {
    /// Plain single node, no cluster support.
    pub async fn start() -> Self {
        Self::start_configured((0, 16383), Vec::new(), false, None).await
    }

    pub async fn start_configured(
        slot_range: (u16, u16),
        shards: Vec<(u16, u16, Vec<SocketAddr>)>,
        cluster_enabled: bool,
        password: Option<String>,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock node");
        let addr = listener.local_addr().expect("mock addr");

        let mut shards = shards;
        if cluster_enabled && !shards.iter().any(|(_, _, nodes)| nodes.contains(&addr)) {
            shards.push((slot_range.0, slot_range.1, vec![addr]));
            shards.sort_by_key(|(first, _, _)| *first);
        }

        let moved_peers = shards
            .iter()
            .filter_map(|(first, last, nodes)| nodes.first().map(|a| (*first, *last, *a)))
            .collect();

        let node = Self {
            addr,
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                slot_range,
                moved_peers: Mutex::new(moved_peers),
                shards: Mutex::new(shards),
                cluster_enabled,
                password,
            }),
            listener_task: Mutex::new(None),
            conn_tasks: Arc::new(Mutex::new(Vec::new())),
        };
        node.serve(listener);
        node
    }

    fn serve(&self, listener: TcpListener) {
        let shared = self.shared.clone();
        let conn_tasks = self.conn_tasks.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let shared = shared.clone();
                let handle = tokio::spawn(async move {
                    let _ = handle_connection(stream, shared).await;
                });
                conn_tasks.lock().unwrap().push(handle);
            }
        });
        *self.listener_task.lock().unwrap() = Some(task);
    }

    /// Drops the listener and every open connection; the store survives.
    pub fn kill(&self) {
        if let Some(task) = self.listener_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.conn_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Rebinds the same address after a `kill`.
    ///
    /// The aborted listener task's socket is closed asynchronously by the
    /// runtime, so the rebind may race a still-open fd; retry briefly.
    pub async fn restart(&self) {
        let mut attempt = 0;
        let listener = loop {
            match TcpListener::bind(self.addr).await {
                Ok(listener) => break listener,
                Err(_) if attempt < 50 => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                Err(err) => panic!("rebind mock node: {err}"),
            }
        };
        self.serve(listener);
    }

    pub fn url(&self) -> String {
        format!("sock://{}", self.addr)
    }

    /// Registers another shard of the cluster with its master address.
    pub fn add_shard(&self, first: u16, last: u16, addr: SocketAddr) {
        let mut shards = self.shared.shards.lock().unwrap();
        shards.push((first, last, vec![addr]));
        shards.sort_by_key(|(first, _, _)| *first);
        let mut peers = self.shared.moved_peers.lock().unwrap();
        peers.push((first, last, addr));
        peers.sort_by_key(|(first, _, _)| *first);
    }

    /// Advertises a replica for the shard starting at `first`.
    pub fn add_replica(&self, first: u16, addr: SocketAddr) {
        let mut shards = self.shared.shards.lock().unwrap();
        if let Some((_, _, nodes)) = shards.iter_mut().find(|(f, _, _)| *f == first) {
            nodes.push(addr);
        }
    }

    /// Overrides the CLUSTER SLOTS advertisement (stale-topology tests).
    pub fn set_advertised_shards(&self, shards: Vec<(u16, u16, Vec<SocketAddr>)>) {
        *self.shared.shards.lock().unwrap() = shards;
    }

    /// Overrides the MOVED redirection targets.
    pub fn set_moved_peers(&self, peers: Vec<(u16, u16, SocketAddr)>) {
        *self.shared.moved_peers.lock().unwrap() = peers;
    }

    /// Number of tuple lists currently stored on this node.
    pub fn list_count(&self) -> usize {
        self.shared.store.lock().unwrap().lists.len()
    }

    /// True if any key (list or hash) survives on this node.
    pub fn is_empty(&self) -> bool {
        let store = self.shared.store.lock().unwrap();
        store.lists.is_empty() && store.hashes.is_empty()
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut framed = FramedRead::new(read_half, ValueDecoder);

    let mut authed = shared.password.is_none();
    let mut in_multi = false;
    let mut queued: Vec<Vec<Bytes>> = Vec::new();

    while let Some(frame) = framed.next().await {
        let Ok(value) = frame else {
            return Ok(());
        };
        let Some(args) = command_args(&value) else {
            write_half.write_all(&error("ERR protocol")).await?;
            continue;
        };

        let reply = dispatch(&shared, args, &mut authed, &mut in_multi, &mut queued);
        write_half.write_all(&reply).await?;
    }

    Ok(())
}

fn command_args(value: &Value) -> Option<Vec<Bytes>> {
    let Value::Array(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|item| match item {
            Value::Bulk(bytes) => Some(bytes.clone()),
            _ => None,
        })
        .collect()
}

fn dispatch(
    shared: &Shared,
    args: Vec<Bytes>,
    authed: &mut bool,
    in_multi: &mut bool,
    queued: &mut Vec<Vec<Bytes>>,
) -> Vec<u8> {
    let name = args
        .first()
        .map(|n| n.to_ascii_uppercase())
        .unwrap_or_default();

    if name == b"AUTH" {
        let expected = shared.password.as_deref().unwrap_or_default().as_bytes();
        return if args.len() == 2 && args[1].as_ref() == expected {
            *authed = true;
            simple("OK")
        } else {
            error("WRONGPASS invalid password")
        };
    }
    if !*authed {
        return error("NOAUTH Authentication required.");
    }

    match name.as_slice() {
        b"MULTI" => {
            *in_multi = true;
            queued.clear();
            simple("OK")
        }
        b"EXEC" => {
            *in_multi = false;
            let mut body = Vec::new();
            for queued_args in queued.drain(..) {
                body.push(apply(shared, queued_args));
            }
            let mut reply = format!("*{}\r\n", body.len()).into_bytes();
            for part in body {
                reply.extend_from_slice(&part);
            }
            reply
        }
        _ if *in_multi => {
            queued.push(args);
            simple("QUEUED")
        }
        _ => apply(shared, args),
    }
}

fn apply(shared: &Shared, args: Vec<Bytes>) -> Vec<u8> {
    let name = args
        .first()
        .map(|n| n.to_ascii_uppercase())
        .unwrap_or_default();

    // cluster ownership of key-addressed commands
    if let Some(key) = keyed_command_key(&name, &args) {
        let slot = hash_slot(key);
        if slot < shared.slot_range.0 || slot > shared.slot_range.1 {
            let peers = shared.moved_peers.lock().unwrap();
            if let Some((_, _, owner)) = peers
                .iter()
                .find(|(first, last, _)| *first <= slot && slot <= *last)
            {
                return error(&format!("MOVED {slot} {}:{}", owner.ip(), owner.port()));
            }
        }
    }

    let mut store = shared.store.lock().unwrap();
    match name.as_slice() {
        b"PING" => simple("PONG"),
        b"ASKING" => simple("OK"),
        b"ROLE" => {
            let mut reply = b"*3\r\n".to_vec();
            reply.extend_from_slice(&bulk(b"master"));
            reply.extend_from_slice(&int(0));
            reply.extend_from_slice(b"*0\r\n");
            reply
        }
        b"CLUSTER" => {
            if !shared.cluster_enabled {
                return error("ERR This instance has cluster support disabled");
            }
            let shards = shared.shards.lock().unwrap();
            let mut reply = format!("*{}\r\n", shards.len()).into_bytes();
            for (first, last, nodes) in shards.iter() {
                reply.extend_from_slice(format!("*{}\r\n", 2 + nodes.len()).as_bytes());
                reply.extend_from_slice(&int(*first as i64));
                reply.extend_from_slice(&int(*last as i64));
                for addr in nodes {
                    reply.extend_from_slice(b"*3\r\n");
                    reply.extend_from_slice(&bulk(addr.ip().to_string().as_bytes()));
                    reply.extend_from_slice(&int(addr.port() as i64));
                    reply.extend_from_slice(&bulk(b"mock-node-id"));
                }
            }
            reply
        }
        b"RPUSH" => {
            let list = store.lists.entry(args[1].to_vec()).or_default();
            for value in &args[2..] {
                list.push_back(value.clone());
            }
            int(list.len() as i64)
        }
        b"LPOP" => match store.lists.get_mut(args[1].as_ref()) {
            Some(list) => {
                let value = list.pop_front();
                if list.is_empty() {
                    store.lists.remove(args[1].as_ref());
                }
                value.map(|v| bulk(&v)).unwrap_or_else(nil)
            }
            None => nil(),
        },
        b"LINDEX" => store
            .lists
            .get(args[1].as_ref())
            .and_then(|list| list.front())
            .map(|v| bulk(v))
            .unwrap_or_else(nil),
        b"DEL" => {
            let mut deleted = 0;
            for key in &args[1..] {
                if store.lists.remove(key.as_ref()).is_some() {
                    deleted += 1;
                }
                if store.hashes.remove(key.as_ref()).is_some() {
                    deleted += 1;
                }
            }
            int(deleted)
        }
        b"EXISTS" => {
            let key = args[1].as_ref();
            int((store.lists.contains_key(key) || store.hashes.contains_key(key)) as i64)
        }
        b"HSETNX" => {
            let hash = store.hashes.entry(args[1].to_vec()).or_default();
            if hash.contains_key(args[2].as_ref()) {
                int(0)
            } else {
                hash.insert(args[2].to_vec(), args[3].to_vec());
                int(1)
            }
        }
        b"HMSET" => {
            let hash = store.hashes.entry(args[1].to_vec()).or_default();
            for pair in args[2..].chunks_exact(2) {
                hash.insert(pair[0].to_vec(), pair[1].to_vec());
            }
            simple("OK")
        }
        b"HSET" => {
            let hash = store.hashes.entry(args[1].to_vec()).or_default();
            let mut created = 0;
            for pair in args[2..].chunks_exact(2) {
                if hash.insert(pair[0].to_vec(), pair[1].to_vec()).is_none() {
                    created += 1;
                }
            }
            int(created)
        }
        b"HMGET" => {
            let hash = store.hashes.get(args[1].as_ref());
            let mut reply = format!("*{}\r\n", args.len() - 2).into_bytes();
            for field in &args[2..] {
                match hash.and_then(|h| h.get(field.as_ref())) {
                    Some(value) => reply.extend_from_slice(&bulk(value)),
                    None => reply.extend_from_slice(&nil()),
                }
            }
            reply
        }
        b"HGETALL" => {
            let mut reply = Vec::new();
            let mut fields = 0;
            if let Some(hash) = store.hashes.get(args[1].as_ref()) {
                for (field, value) in hash {
                    reply.extend_from_slice(&bulk(field));
                    reply.extend_from_slice(&bulk(value));
                    fields += 2;
                }
            }
            let mut framed = format!("*{fields}\r\n").into_bytes();
            framed.extend_from_slice(&reply);
            framed
        }
        b"HINCRBY" => {
            let hash = store.hashes.entry(args[1].to_vec()).or_default();
            let delta: i64 = std::str::from_utf8(&args[3]).unwrap().parse().unwrap();
            let current: i64 = hash
                .get(args[2].as_ref())
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let updated = current + delta;
            hash.insert(args[2].to_vec(), updated.to_string().into_bytes());
            int(updated)
        }
        b"SCAN" => {
            // single batch: every matching key, terminal cursor
            let pattern = scan_pattern(&args);
            let mut keys: Vec<&Vec<u8>> = store
                .lists
                .keys()
                .chain(store.hashes.keys())
                .filter(|key| glob_match(pattern, key))
                .collect();
            keys.sort();

            let mut reply = b"*2\r\n".to_vec();
            reply.extend_from_slice(&bulk(b"0"));
            reply.extend_from_slice(format!("*{}\r\n", keys.len()).as_bytes());
            for key in keys {
                reply.extend_from_slice(&bulk(key));
            }
            reply
        }
        b"DUMP" => match store.lists.get(args[1].as_ref()) {
            Some(list) => {
                let mut payload = BytesMut::new();
                for value in list {
                    payload.put_u32_le(value.len() as u32);
                    payload.put_slice(value);
                }
                bulk(&payload)
            }
            None => nil(),
        },
        b"RESTORE" => {
            if store.lists.contains_key(args[1].as_ref()) {
                return error("BUSYKEY Target key name already exists.");
            }
            let mut list = VecDeque::new();
            let mut payload = args[3].as_ref();
            while payload.len() >= 4 {
                let len = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
                payload = &payload[4..];
                if payload.len() < len {
                    break;
                }
                list.push_back(Bytes::copy_from_slice(&payload[..len]));
                payload = &payload[len..];
            }
            store.lists.insert(args[1].to_vec(), list);
            simple("OK")
        }
        _ => error("ERR unknown command"),
    }
}

/// The key that decides cluster routing, for commands that have one.
fn keyed_command_key<'a>(name: &[u8], args: &'a [Bytes]) -> Option<&'a [u8]> {
    match name {
        b"RPUSH" | b"LPOP" | b"LINDEX" | b"DEL" | b"EXISTS" | b"HSETNX" | b"HMSET" | b"HSET"
        | b"HMGET" | b"HGETALL" | b"HINCRBY" | b"DUMP" | b"RESTORE" => {
            args.get(1).map(|k| k.as_ref())
        }
        _ => None,
    }
}

fn scan_pattern<'a>(args: &'a [Bytes]) -> &'a [u8] {
    args.windows(2)
        .find(|pair| pair[0].to_ascii_uppercase() == b"MATCH")
        .map(|pair| pair[1].as_ref())
        .unwrap_or(b"*")
}

/// Minimal glob: `*` (any run) and `?` (any byte).
fn glob_match(pattern: &[u8], key: &[u8]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], key)
                || (!key.is_empty() && glob_match(pattern, &key[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => glob_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn simple(text: &str) -> Vec<u8> {
    format!("+{text}\r\n").into_bytes()
}

fn error(text: &str) -> Vec<u8> {
    format!("-{text}\r\n").into_bytes()
}

fn int(value: i64) -> Vec<u8> {
    format!(":{value}\r\n").into_bytes()
}

fn bulk(value: &[u8]) -> Vec<u8> {
    let mut reply = format!("${}\r\n", value.len()).into_bytes();
    reply.extend_from_slice(value);
    reply.extend_from_slice(b"\r\n");
    reply
}

fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
