/*!
dbroker is a tuple-space client for Redis Cluster.

Applications create or attach to named namespaces and exchange tuples
through them: `put` appends a value under a name, `get` consumes values in
FIFO order, `read` peeks without consuming, plus `remove`, `move`,
`directory` listing and cursor-based iteration. A namespace `NS` maps to a
Redis metadata hash under the key `NS` and one Redis list per tuple name
under `NS::name`.

# Features
* Transparent Redis Cluster support: slot hashing, `MOVED`/`ASK`
  redirections, master/replica fail-over recovery
* Works against a single Redis node as well
* Pipelined multi-stage request engine with coalesced sends
* Blocking and tag-based asynchronous operation
* AUTH support via a secret file
* Configuration from the environment (`DBR_SERVER`, `DBR_AUTHFILE`,
  `DBR_TIMEOUT`)

# Basic Usage

```no_run
use dbroker::{client::Client, Flags, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let client = Client::connect().await?;

    let ns = client.create_namespace("sensors", "").await?;

    client.put(ns, "temp", &b"21.5"[..]).await?;
    let value = client.read(ns, "temp", Flags::Nowait).await?;
    assert_eq!(&b"21.5"[..], &value);

    for name in client.directory(ns, "*").await? {
        println!("tuple: {name}");
    }

    client.delete_namespace(ns).await?;
    Ok(())
}
```
*/

pub mod client;
mod engine;
mod error;
mod network;
pub mod resp;

pub use engine::{Flags, IterHandle, NsMeta};
pub use error::*;
pub use network::Address;

/// Library general result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests;
