use redis::aio::{ConnectionLike, MultiplexedConnection, PubSub};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisFuture, Value};

/// Names for the coordination keyspace under a deployment prefix.
#[derive(Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn cfg(&self) -> String {
        format!("{}_cfg", self.prefix)
    }

    pub fn notify(&self) -> String {
        format!("{}_notify", self.prefix)
    }

    pub fn stats(&self) -> String {
        format!("{}_stats", self.prefix)
    }

    pub fn queue(&self, shard: usize) -> String {
        format!("{}_q{}", self.prefix, shard)
    }
}

/// Handle to the coordination store. Addresses containing "cluster" select a
/// cluster client; `tls` switches the URL scheme to `rediss://`.
#[derive(Clone)]
pub struct Coord {
    kind: ClientKind,
    seed_url: String,
}

#[derive(Clone)]
enum ClientKind {
    Single(redis::Client),
    Cluster(ClusterClient),
}

/// A single connection to the coordination store, usable with the usual
/// `AsyncCommands` surface regardless of topology.
#[derive(Clone)]
pub enum Conn {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Self::Single(conn) => conn.req_packed_command(cmd),
            Self::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Self::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            Self::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Single(conn) => conn.get_db(),
            Self::Cluster(conn) => conn.get_db(),
        }
    }
}

pub fn url_for(addr: &str, tls: bool) -> String {
    let scheme = if tls { "rediss" } else { "redis" };
    format!("{scheme}://{addr}")
}

impl Coord {
    pub fn open(addr: &str, tls: bool) -> Result<Self, redis::RedisError> {
        let url = url_for(addr, tls);
        let kind = if addr.contains("cluster") {
            ClientKind::Cluster(ClusterClient::new(vec![url.clone()])?)
        } else {
            ClientKind::Single(redis::Client::open(url.clone())?)
        };
        Ok(Self {
            kind,
            seed_url: url,
        })
    }

    pub async fn connect(&self) -> Result<Conn, redis::RedisError> {
        match &self.kind {
            ClientKind::Single(client) => Ok(Conn::Single(
                client.get_multiplexed_async_connection().await?,
            )),
            ClientKind::Cluster(client) => {
                Ok(Conn::Cluster(client.get_async_connection().await?))
            }
        }
    }

    /// Subscriptions always go to the seed node: cluster connections do not
    /// expose pub/sub, and control traffic needs no slot routing.
    pub async fn pubsub(&self) -> Result<PubSub, redis::RedisError> {
        let client = redis::Client::open(self.seed_url.as_str())?;
        client.get_async_pubsub().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_names() {
        let keyspace = Keyspace::new("dst");
        assert_eq!(keyspace.cfg(), "dst_cfg");
        assert_eq!(keyspace.notify(), "dst_notify");
        assert_eq!(keyspace.stats(), "dst_stats");
        assert_eq!(keyspace.queue(0), "dst_q0");
        assert_eq!(keyspace.queue(31), "dst_q31");
    }

    #[test]
    fn url_scheme_follows_tls() {
        assert_eq!(url_for("localhost:6379", false), "redis://localhost:6379");
        assert_eq!(
            url_for("my-cluster.example.com:6379", true),
            "rediss://my-cluster.example.com:6379"
        );
    }
}
