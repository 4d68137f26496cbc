use crate::{
    Error, Result,
    client::{Config, NamespaceRegistry, NsHandle, validate_name},
    engine::{
        Completion, CompletionData, Engine, Flags, IterHandle, NsMeta, Opcode, Request, Tag,
    },
};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Pause between attempts of a blocking `get`/`read` on an empty tuple.
const BLOCKING_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Tag of an asynchronously posted request, redeemed via
/// [`Client::test`] / [`Client::wait_for`] or withdrawn via
/// [`Client::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag(pub(crate) Tag);

#[derive(Debug)]
struct Inner {
    engine: Engine,
    namespaces: NamespaceRegistry,
}

/// Tuple-space client over a Redis cluster.
///
/// Applications create or attach to named namespaces and then `put`, `get`
/// (consuming FIFO), `read` (non-consuming), `remove`, `move` and iterate
/// over tuples. A coarse lock serializes calls across tasks; the engine
/// underneath runs cooperatively on the calling task.
///
/// # Example
/// ```no_run
/// use dbroker::{client::Client, Flags, Result};
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let client = Client::connect().await?;
///
///     let ns = client.create_namespace("jobs", "").await?;
///     client.put(ns, "queue", &b"job-1"[..]).await?;
///     let job = client.get(ns, "queue", Flags::Nowait).await?;
///     assert_eq!(&b"job-1"[..], &job);
///
///     client.delete_namespace(ns).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Client {
    inner: Mutex<Inner>,
}

impl Client {
    /// Connects using the `DBR_SERVER` / `DBR_AUTHFILE` / `DBR_TIMEOUT`
    /// environment.
    pub async fn connect() -> Result<Client> {
        Self::connect_with(Config::from_env()?).await
    }

    pub async fn connect_with(config: Config) -> Result<Client> {
        let engine = Engine::init(config).await?;
        Ok(Client {
            inner: Mutex::new(Inner {
                engine,
                namespaces: NamespaceRegistry::new(),
            }),
        })
    }

    /// Creates the namespace remotely and attaches to it.
    pub async fn create_namespace(&self, name: &str, groups: &str) -> Result<NsHandle> {
        validate_name(name)?;

        let mut inner = self.inner.lock().await;
        let mut request = Request::new(Opcode::NsCreate, name);
        request.groups = groups.to_owned();
        run(&mut inner.engine, request).await?;
        inner.namespaces.create(name)
    }

    /// Attaches to an existing namespace; fails with
    /// [`Error::NsInvalid`](crate::Error::NsInvalid) if it does not exist.
    pub async fn attach_namespace(&self, name: &str) -> Result<NsHandle> {
        validate_name(name)?;

        let mut inner = self.inner.lock().await;
        run(&mut inner.engine, Request::new(Opcode::NsAttach, name)).await?;
        inner.namespaces.attach(name)
    }

    /// Releases one attachment. The last detach cluster-wide removes the
    /// namespace content.
    pub async fn detach_namespace(&self, handle: NsHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        run(&mut inner.engine, Request::new(Opcode::NsDetach, name)).await?;
        inner.namespaces.detach(handle)?;
        Ok(())
    }

    /// Marks the namespace for deletion and releases the caller's
    /// attachment, which removes the data if nobody else is attached.
    pub async fn delete_namespace(&self, handle: NsHandle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        run(&mut inner.engine, Request::new(Opcode::NsDelete, name.clone())).await?;
        run(&mut inner.engine, Request::new(Opcode::NsDetach, name)).await?;
        inner.namespaces.detach(handle)?;
        Ok(())
    }

    /// Namespace metadata (id, reference count, group list).
    pub async fn query_namespace(&self, handle: NsHandle) -> Result<NsMeta> {
        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let completion = run(&mut inner.engine, Request::new(Opcode::NsQuery, name)).await?;
        match completion.data {
            CompletionData::Meta(meta) => Ok(meta),
            _ => Err(Error::BeGeneral),
        }
    }

    /// Appends a tuple under `key` (FIFO per key).
    pub async fn put(
        &self,
        handle: NsHandle,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<()> {
        validate_name(key)?;

        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let mut request = Request::new(Opcode::Put, name);
        request.key = Bytes::copy_from_slice(key.as_bytes());
        request.value = value.into();
        run(&mut inner.engine, request).await?;
        Ok(())
    }

    /// Pops the oldest tuple under `key`. Blocks up to the configured
    /// timeout unless [`Flags::Nowait`] is given.
    pub async fn get(&self, handle: NsHandle, key: &str, flags: Flags) -> Result<Bytes> {
        self.fetch(handle, key, flags, Opcode::Get).await
    }

    /// Reads the oldest tuple under `key` without consuming it.
    pub async fn read(&self, handle: NsHandle, key: &str, flags: Flags) -> Result<Bytes> {
        self.fetch(handle, key, flags, Opcode::Read).await
    }

    async fn fetch(
        &self,
        handle: NsHandle,
        key: &str,
        flags: Flags,
        opcode: Opcode,
    ) -> Result<Bytes> {
        validate_name(key)?;

        let deadline = {
            let inner = self.inner.lock().await;
            let timeout = inner.engine.config.timeout;
            (!timeout.is_zero()).then(|| Instant::now() + timeout)
        };

        loop {
            let result = {
                let mut inner = self.inner.lock().await;
                let name = inner.namespaces.validate(handle)?.to_owned();
                let mut request = Request::new(opcode, name);
                request.key = Bytes::copy_from_slice(key.as_bytes());
                run(&mut inner.engine, request).await
            };

            match result {
                Ok(completion) => match completion.data {
                    CompletionData::Value(value) => return Ok(value),
                    _ => return Err(Error::BeGeneral),
                },
                Err(e) if e.is_unavailable() => {
                    if flags == Flags::Nowait {
                        // NOWAIT callers see "no data" instead of a timeout
                        return Err(Error::Unavailable);
                    }
                    if let Some(deadline) = deadline
                        && Instant::now() >= deadline
                    {
                        return Err(Error::Timeout);
                    }
                    tokio::time::sleep(BLOCKING_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deletes every tuple stored under `key`.
    pub async fn remove(&self, handle: NsHandle, key: &str) -> Result<()> {
        validate_name(key)?;

        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let mut request = Request::new(Opcode::Remove, name);
        request.key = Bytes::copy_from_slice(key.as_bytes());
        run(&mut inner.engine, request).await?;
        Ok(())
    }

    /// Moves the whole tuple list under `key` from `src` to `dst`
    /// (DUMP / RESTORE / DEL).
    pub async fn move_tuple(
        &self,
        src: NsHandle,
        key: &str,
        dst: NsHandle,
    ) -> Result<()> {
        validate_name(key)?;

        let mut inner = self.inner.lock().await;
        let src_name = inner.namespaces.validate(src)?.to_owned();
        let dst_name = inner.namespaces.validate(dst)?.to_owned();
        let mut request = Request::new(Opcode::Move, src_name);
        request.key = Bytes::copy_from_slice(key.as_bytes());
        request.dst_ns = dst_name;
        run(&mut inner.engine, request).await?;
        Ok(())
    }

    /// Lists the tuple names of the namespace matching `pattern`
    /// (glob-style, `*` for all).
    pub async fn directory(&self, handle: NsHandle, pattern: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let mut request = Request::new(Opcode::Directory, name);
        request.pattern = pattern.to_owned();
        let completion = run(&mut inner.engine, request).await?;
        match completion.data {
            CompletionData::Names(names) => Ok(names
                .iter()
                .map(|name| String::from_utf8_lossy(name).into_owned())
                .collect()),
            _ => Err(Error::BeGeneral),
        }
    }

    /// Steps a key iterator: `None` starts a fresh traversal, a previous
    /// handle continues it. Returns `Ok(None)` once exhausted.
    pub async fn iterate(
        &self,
        handle: NsHandle,
        prev: Option<IterHandle>,
    ) -> Result<Option<(IterHandle, String)>> {
        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let mut request = Request::new(Opcode::Iterator, name);
        request.iterator = prev.map(|handle| handle.0);

        match run(&mut inner.engine, request).await {
            Ok(completion) => match completion.data {
                CompletionData::IterKey { handle, key } => Ok(Some((
                    IterHandle(handle),
                    String::from_utf8_lossy(&key).into_owned(),
                ))),
                _ => Err(Error::BeGeneral),
            },
            Err(Error::Unavailable) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Posts a put without waiting; redeem the tag with
    /// [`test`](Self::test) or [`wait_for`](Self::wait_for).
    pub async fn put_tagged(
        &self,
        handle: NsHandle,
        key: &str,
        value: impl Into<Bytes>,
    ) -> Result<RequestTag> {
        validate_name(key)?;

        let mut inner = self.inner.lock().await;
        let name = inner.namespaces.validate(handle)?.to_owned();
        let mut request = Request::new(Opcode::Put, name);
        request.key = Bytes::copy_from_slice(key.as_bytes());
        request.value = value.into();
        Ok(RequestTag(inner.engine.post(request)?))
    }

    /// Non-blocking completion poll: `Ok(Some(rc))` once the request
    /// finished, `Ok(None)` while it is still in flight.
    pub async fn test(&self, tag: RequestTag) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().await;
        match inner.engine.test(tag.0).await {
            Some(completion) => completion.result.map(Some),
            None => Ok(None),
        }
    }

    /// Blocks until the tagged request completes (or the timeout expires).
    pub async fn wait_for(&self, tag: RequestTag) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.engine.wait(tag.0).await?.result
    }

    /// Requests cancellation of an outstanding tagged request. A request
    /// not yet sent is dropped; one already on the wire completes as
    /// [`Error::Cancelled`](crate::Error::Cancelled).
    pub async fn cancel(&self, tag: RequestTag) {
        let mut inner = self.inner.lock().await;
        inner.engine.cancel(tag.0);
    }
}

/// Posts a request and drives the engine to its completion; a completion
/// carrying an error status becomes that error.
async fn run(engine: &mut Engine, request: Request) -> Result<Completion> {
    let tag = engine.post(request)?;
    let Completion { tag, result, data } = engine.wait(tag).await?;
    let rc = result?;
    Ok(Completion {
        tag,
        result: Ok(rc),
        data,
    })
}
