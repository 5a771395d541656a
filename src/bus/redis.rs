/***************************************/
/*        3rd party libraries          */
/***************************************/
use crossbeam_channel as cbc;
use log::{debug, info, warn};
use rand::Rng;
use redis::cluster::{ClusterClient, ClusterConnection};
use redis::streams::{StreamAutoClaimReply, StreamId, StreamReadReply};
use redis::{ConnectionLike, FromRedisValue, RedisError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, Builder};
use std::time::Duration;

/***************************************/
/*           Local modules             */
/***************************************/
use crate::bus::{Delivery, MessageBus, RetryPolicy, StateStore, Subscription};
use crate::config::BusConfig;
use crate::shared::{BusError, BusNames, ElevatorId, ElevatorState};

const PAYLOAD_FIELD: &str = "payload";
const SUBSCRIBER_POLL: Duration = Duration::from_millis(500);

/**
 * Redis-backed bus and state store.
 *
 * - Request queue:   Redis Stream, one `payload` field per entry holding the JSON message.
 * - Consumer groups: `XREADGROUP`, `XACK`, with `XAUTOCLAIM` reclaiming idle pending entries.
 * - Broadcast:       Pub/Sub. Subscriptions run on their own thread and reconnect forever.
 * - State:           plain string keys holding the JSON `ElevatorState`.
 *
 * Connections are opened lazily and dropped on I/O errors so the next call reconnects.
 * Every call is bounded by `io_timeout`; a blocking `XREADGROUP` gets its block time on
 * top. A timeout surfaces as a transient error. Callers wrap operations in a `RetryPolicy`.
 */
pub struct RedisBus {
    client: Client,
    conn: Option<Connection>,
    names: BusNames,
    redelivery_idle_ms: u64,
    io_timeout: Duration,
    resubscribe: RetryPolicy,
}

#[derive(Clone)]
enum Client {
    Single(redis::Client),
    Cluster {
        client: ClusterClient,
        pubsub: redis::Client,
    },
}

enum Connection {
    Single(redis::Connection),
    Cluster(ClusterConnection),
}

impl Connection {
    fn as_dyn(&mut self) -> &mut dyn ConnectionLike {
        match self {
            Connection::Single(conn) => conn,
            Connection::Cluster(conn) => conn,
        }
    }

    fn set_timeouts(&self, read: Duration, write: Duration) -> Result<(), RedisError> {
        match self {
            Connection::Single(conn) => {
                conn.set_read_timeout(Some(read))?;
                conn.set_write_timeout(Some(write))
            }
            Connection::Cluster(conn) => {
                conn.set_read_timeout(Some(read))?;
                conn.set_write_timeout(Some(write))
            }
        }
    }
}

impl Client {
    fn open(config: &BusConfig) -> Result<Client, RedisError> {
        if !config.cluster {
            return Ok(Client::Single(redis::Client::open(config.url.as_str())?));
        }

        let nodes = if config.cluster_nodes.is_empty() {
            vec![config.url.clone()]
        } else {
            config.cluster_nodes.clone()
        };
        // Pub/Sub messages are broadcast cluster-wide, any seed node will do
        let pubsub = redis::Client::open(nodes[0].as_str())?;
        let client = ClusterClient::builder(nodes)
            .connection_timeout(config.io_timeout())
            .build()?;

        Ok(Client::Cluster { client, pubsub })
    }

    fn connect(&self, io_timeout: Duration) -> Result<Connection, RedisError> {
        let conn = match self {
            Client::Single(client) => {
                Connection::Single(client.get_connection_with_timeout(io_timeout)?)
            }
            Client::Cluster { client, .. } => Connection::Cluster(client.get_connection()?),
        };
        conn.set_timeouts(io_timeout, io_timeout)?;
        Ok(conn)
    }

    fn pubsub_client(&self) -> redis::Client {
        match self {
            Client::Single(client) => client.clone(),
            Client::Cluster { pubsub, .. } => pubsub.clone(),
        }
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_cluster_error()
}

fn bus_error(err: RedisError) -> BusError {
    if is_connection_error(&err) {
        BusError::Transient(err.to_string())
    } else {
        BusError::Protocol(err.to_string())
    }
}

fn store_error(err: RedisError) -> BusError {
    if is_connection_error(&err) {
        BusError::StateStoreUnavailable(err.to_string())
    } else {
        BusError::Protocol(err.to_string())
    }
}

fn is_existing_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP")
}

fn delivery(entry: &StreamId) -> Delivery {
    Delivery {
        message_id: entry.id.clone(),
        // A missing field surfaces as an empty, malformed payload downstream
        payload: entry.get::<String>(PAYLOAD_FIELD).unwrap_or_default(),
    }
}

fn first_claimed(reply: &StreamAutoClaimReply) -> Option<Delivery> {
    reply.claimed.first().map(delivery)
}

fn first_read(reply: Option<StreamReadReply>) -> Option<Delivery> {
    reply.and_then(|reply| {
        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .next()
            .map(delivery)
    })
}

impl RedisBus {
    pub fn new(config: &BusConfig, resubscribe: RetryPolicy) -> Result<RedisBus, BusError> {
        let client = Client::open(config).map_err(|e| BusError::Protocol(e.to_string()))?;

        Ok(RedisBus {
            client,
            conn: None,
            names: BusNames::new(config),
            redelivery_idle_ms: config.redelivery_idle_ms,
            io_timeout: config.io_timeout(),
            resubscribe,
        })
    }

    fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> Result<T, RedisError> {
        self.query_within(cmd, self.io_timeout)
    }

    /// Runs `cmd` allowing `read_timeout` for the reply.
    fn query_within<T: FromRedisValue>(
        &mut self,
        cmd: &redis::Cmd,
        read_timeout: Duration,
    ) -> Result<T, RedisError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                debug!("opening redis connection");
                self.client.connect(self.io_timeout)?
            }
        };

        let result = conn
            .set_timeouts(read_timeout, self.io_timeout)
            .and_then(|()| cmd.query(conn.as_dyn()));
        match &result {
            Err(e) if is_connection_error(e) => warn!("dropping redis connection: {}", e),
            _ => self.conn = Some(conn),
        }
        result
    }

    fn reclaim_idle(&mut self, queue: &str, group: &str, consumer: &str) -> Result<Option<Delivery>, BusError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(queue)
            .arg(group)
            .arg(consumer)
            .arg(self.redelivery_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1);

        let reply: StreamAutoClaimReply = self.query(&cmd).map_err(bus_error)?;
        Ok(first_claimed(&reply))
    }
}

impl MessageBus for RedisBus {
    fn ensure_group(&mut self, queue: &str, group: &str) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(queue).arg(group).arg("0").arg("MKSTREAM");

        match self.query::<()>(&cmd) {
            Ok(()) => {
                info!("created consumer group: stream={}, group={}", queue, group);
                Ok(())
            }
            Err(e) if is_existing_group(&e) => {
                debug!("consumer group already exists: stream={}, group={}", queue, group);
                Ok(())
            }
            Err(e) => Err(bus_error(e)),
        }
    }

    fn enqueue(&mut self, queue: &str, message: &str) -> Result<String, BusError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue).arg("*").arg(PAYLOAD_FIELD).arg(message);
        self.query(&cmd).map_err(bus_error)
    }

    fn consume(
        &mut self,
        queue: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        if let Some(reclaimed) = self.reclaim_idle(queue, group, consumer)? {
            debug!("reclaimed idle entry: stream={}, id={}", queue, reclaimed.message_id);
            return Ok(Some(reclaimed));
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(queue)
            .arg(">");

        let reply: Option<StreamReadReply> = self
            .query_within(&cmd, self.io_timeout + block_timeout)
            .map_err(bus_error)?;
        Ok(first_read(reply))
    }

    fn ack(&mut self, queue: &str, group: &str, ack_token: &str) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(queue).arg(group).arg(ack_token);
        self.query::<i64>(&cmd).map(|_| ()).map_err(bus_error)
    }

    fn publish(&mut self, channel: &str, message: &str) -> Result<(), BusError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(message);
        self.query::<i64>(&cmd).map(|_| ()).map_err(bus_error)
    }

    fn subscribe(&mut self, channel: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = cbc::unbounded::<String>();
        let closed = Arc::new(AtomicBool::new(false));

        let reader = SubscriptionReader {
            client: self.client.pubsub_client(),
            channel: channel.to_string(),
            tx,
            closed: closed.clone(),
            io_timeout: self.io_timeout,
            backoff: ReconnectBackoff::new(self.resubscribe.clone()),
        };
        Builder::new()
            .name(format!("subscriber:{}", channel))
            .spawn(move || reader.run())
            .map_err(|e| BusError::Protocol(format!("failed to spawn subscriber thread: {}", e)))?;

        Ok(Subscription::new(rx, closed))
    }
}

impl StateStore for RedisBus {
    fn get_state(&mut self, id: ElevatorId) -> Result<Option<ElevatorState>, BusError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.names.state_key(id));

        let raw: Option<String> = self.query(&cmd).map_err(store_error)?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| BusError::Malformed(format!("state of elevator {}: {}", id, e))),
            None => Ok(None),
        }
    }

    fn put_state(&mut self, id: ElevatorId, state: &ElevatorState) -> Result<(), BusError> {
        let json = serde_json::to_string(state)
            .map_err(|e| BusError::Malformed(format!("state of elevator {}: {}", id, e)))?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.names.state_key(id)).arg(json);
        self.query::<()>(&cmd).map_err(store_error)
    }
}

/// Growing delay between resubscribe attempts, back to the base once a subscribe succeeds.
struct ReconnectBackoff {
    policy: RetryPolicy,
    failures: u32,
}

impl ReconnectBackoff {
    fn new(policy: RetryPolicy) -> ReconnectBackoff {
        ReconnectBackoff { policy, failures: 0 }
    }

    fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy
            .jittered_delay(self.failures.min(self.policy.max_attempts), rng)
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/**
 * Feeds one Pub/Sub channel into a crossbeam channel.
 *
 * Reconnects with backoff whenever the connection drops; messages published in the
 * meantime are lost. Stops once the owning `Subscription` is dropped.
 */
struct SubscriptionReader {
    client: redis::Client,
    channel: String,
    tx: cbc::Sender<String>,
    closed: Arc<AtomicBool>,
    io_timeout: Duration,
    backoff: ReconnectBackoff,
}

impl SubscriptionReader {
    fn run(mut self) {
        let mut rng = rand::thread_rng();

        while !self.closed.load(Ordering::SeqCst) {
            match self.listen() {
                Ok(()) => return,
                Err(e) => {
                    let delay = self.backoff.next_delay(&mut rng);
                    warn!(
                        "subscription lost: channel={}, failures={}, retry_in_ms={}, error={}",
                        self.channel,
                        self.backoff.failures,
                        delay.as_millis(),
                        e
                    );
                    sleep(delay);
                }
            }
        }
    }

    /// Returns `Ok` when the subscription was closed, `Err` when the connection failed.
    fn listen(&mut self) -> Result<(), RedisError> {
        let mut conn = self.client.get_connection_with_timeout(self.io_timeout)?;
        conn.set_write_timeout(Some(self.io_timeout))?;
        let mut pubsub = conn.as_pubsub();
        pubsub.set_read_timeout(Some(SUBSCRIBER_POLL))?;
        pubsub.subscribe(self.channel.as_str())?;
        self.backoff.reset();
        info!("subscribed: channel={}", self.channel);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            match pubsub.get_message() {
                Ok(msg) => match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if self.tx.send(payload).is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => warn!("dropping undecodable message on {}: {}", self.channel, e),
                },
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
