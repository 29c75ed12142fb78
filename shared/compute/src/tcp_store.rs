//! Single-host rendezvous store.
//!
//! Rank 0 hosts a TCP listener on the launcher's `MASTER_ADDR:MASTER_PORT`;
//! every rank (rank 0 included) connects to it as a client. The store first
//! waits for the full join set and validates it, then serves collectives in
//! lock step: it reads exactly one request from every rank, in rank order,
//! and answers all of them at once. A member that issues a different
//! collective than its peers, or drops its connection, aborts the group for
//! everyone.

use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use itertools::Itertools;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Runtime,
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use crate::collective::{validate_members, Collective, CollectiveError, GroupSpec};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(1);

type Channel = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Serialize, Deserialize, Debug)]
enum Request {
    Join(GroupSpec),
    Barrier { generation: u64 },
    AllGather { generation: u64, payload: Vec<u8> },
    Leave,
}

impl Request {
    fn describe(&self) -> String {
        match self {
            Request::Join(spec) => format!("join(rank {})", spec.rank),
            Request::Barrier { generation } => format!("barrier#{generation}"),
            Request::AllGather { generation, .. } => format!("all_gather#{generation}"),
            Request::Leave => "leave".to_owned(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
enum Response {
    Joined,
    Released { generation: u64 },
    Gathered { generation: u64, payloads: Vec<Vec<u8>> },
    Left,
    Aborted { reason: String },
}

enum Round {
    Reply(Response),
    Leave,
}

struct Membership {
    spec: GroupSpec,
    channel: Channel,
    generation: u64,
    store: Option<JoinHandle<Result<(), CollectiveError>>>,
}

/// A [`Collective`] backed by a TCP rendezvous store hosted by rank 0.
pub struct TcpStoreCollective {
    addr: String,
    connect_timeout: Duration,
    runtime: Runtime,
    membership: Mutex<Option<Membership>>,
}

impl fmt::Debug for TcpStoreCollective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStoreCollective")
            .field("addr", &self.addr)
            .field("connect_timeout", &self.connect_timeout)
            .field(
                "active",
                &self.membership.try_lock().map(|m| m.is_some()).ok(),
            )
            .finish()
    }
}

impl TcpStoreCollective {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Result<Self, CollectiveError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("nanorun-rendezvous")
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self {
            addr: addr.into(),
            connect_timeout,
            runtime,
            membership: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn membership(&self) -> MutexGuard<'_, Option<Membership>> {
        self.membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one collective round. Any failure leaves the group unusable, so the
    /// membership is dropped and the group reads as inactive from then on.
    fn round(&self, request: impl FnOnce(u64) -> Request) -> Result<Response, CollectiveError> {
        let mut guard = self.membership();
        let membership = guard.as_mut().ok_or(CollectiveError::NotActive)?;
        membership.generation += 1;
        let generation = membership.generation;
        let request = request(generation);
        trace!(rank = membership.spec.rank, request = %request.describe(), "collective");

        let result = self.runtime.block_on(async {
            send(&mut membership.channel, &request).await?;
            recv::<Response>(&mut membership.channel).await
        });
        let response = match result {
            Ok(Response::Aborted { reason }) => Err(CollectiveError::Rejected(reason)),
            Ok(response) => Ok(response),
            Err(err) => Err(err),
        };
        if response.is_err() {
            if let Some(Membership {
                store: Some(store), ..
            }) = guard.take()
            {
                store.abort();
            }
        }
        response
    }
}

impl Collective for TcpStoreCollective {
    fn form_group(&self, spec: GroupSpec) -> Result<(), CollectiveError> {
        let mut guard = self.membership();
        if guard.is_some() {
            return Err(CollectiveError::AlreadyActive);
        }

        let store = if spec.rank == 0 {
            let listener = self
                .runtime
                .block_on(TcpListener::bind(&self.addr))
                .map_err(|source| CollectiveError::Bind {
                    addr: self.addr.clone(),
                    source,
                })?;
            info!(addr = %self.addr, world_size = spec.world_size, "hosting rendezvous store");
            Some(self.runtime.spawn(serve(listener, spec.world_size)))
        } else {
            None
        };

        let joined = self.runtime.block_on(async {
            let mut channel = connect(&self.addr, self.connect_timeout).await?;
            send(&mut channel, &Request::Join(spec)).await?;
            match recv::<Response>(&mut channel).await? {
                Response::Joined => Ok(channel),
                Response::Aborted { reason } => Err(CollectiveError::Rejected(reason)),
                other => Err(CollectiveError::Protocol(format!(
                    "expected join confirmation, got {other:?}"
                ))),
            }
        });

        match joined {
            Ok(channel) => {
                debug!(rank = spec.rank, backend = %spec.backend, "joined group");
                *guard = Some(Membership {
                    spec,
                    channel,
                    generation: 0,
                    store,
                });
                Ok(())
            }
            Err(err) => {
                if let Some(store) = store {
                    store.abort();
                }
                Err(err)
            }
        }
    }

    fn barrier(&self) -> Result<(), CollectiveError> {
        let mut expected = 0;
        match self.round(|generation| {
            expected = generation;
            Request::Barrier { generation }
        })? {
            Response::Released { generation } if generation == expected => Ok(()),
            other => Err(CollectiveError::Protocol(format!(
                "expected barrier#{expected} release, got {other:?}"
            ))),
        }
    }

    fn all_gather(&self, payload: &[u8]) -> Result<Vec<Vec<u8>>, CollectiveError> {
        let mut expected = 0;
        match self.round(|generation| {
            expected = generation;
            Request::AllGather {
                generation,
                payload: payload.to_vec(),
            }
        })? {
            Response::Gathered {
                generation,
                payloads,
            } if generation == expected => Ok(payloads),
            other => Err(CollectiveError::Protocol(format!(
                "expected all_gather#{expected} result, got {other:?}"
            ))),
        }
    }

    fn is_active(&self) -> bool {
        self.membership().is_some()
    }

    fn destroy(&self) -> Result<(), CollectiveError> {
        let Some(mut membership) = self.membership().take() else {
            return Err(CollectiveError::NotActive);
        };
        let rank = membership.spec.rank;

        let left = self.runtime.block_on(async {
            tokio::time::timeout(TEARDOWN_TIMEOUT, async {
                send(&mut membership.channel, &Request::Leave).await?;
                match recv::<Response>(&mut membership.channel).await? {
                    Response::Left => Ok(()),
                    Response::Aborted { reason } => Err(CollectiveError::Rejected(reason)),
                    other => Err(CollectiveError::Protocol(format!(
                        "expected leave confirmation, got {other:?}"
                    ))),
                }
            })
            .await
            .map_err(|_| CollectiveError::Timeout(TEARDOWN_TIMEOUT))?
        });

        if let Some(mut store) = membership.store.take() {
            let finished = self
                .runtime
                .block_on(async { tokio::time::timeout(TEARDOWN_TIMEOUT, &mut store).await });
            match finished {
                Ok(Ok(Ok(()))) => debug!("rendezvous store shut down"),
                Ok(Ok(Err(err))) => warn!("rendezvous store exited with error: {err}"),
                Ok(Err(join_err)) => warn!("rendezvous store task failed: {join_err}"),
                Err(_) => {
                    store.abort();
                    warn!("rendezvous store did not shut down within {TEARDOWN_TIMEOUT:?}");
                }
            }
        }

        debug!(rank, "left group");
        left
    }
}

async fn send<T: Serialize>(channel: &mut Channel, message: &T) -> Result<(), CollectiveError> {
    let bytes = postcard::to_stdvec(message)?;
    channel.send(Bytes::from(bytes)).await?;
    Ok(())
}

async fn recv<T: DeserializeOwned>(channel: &mut Channel) -> Result<T, CollectiveError> {
    match channel.next().await {
        Some(frame) => Ok(postcard::from_bytes(&frame?)?),
        None => Err(CollectiveError::Disconnected(
            "connection closed by peer".to_owned(),
        )),
    }
}

async fn connect(addr: &str, timeout: Duration) -> Result<Channel, CollectiveError> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(50);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(Framed::new(stream, LengthDelimitedCodec::new()));
            }
            // the store may simply not be listening yet
            Err(err) if Instant::now() + backoff < deadline => {
                trace!("rendezvous store at {addr} not reachable yet: {err}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_CONNECT_BACKOFF);
            }
            Err(source) => {
                return Err(CollectiveError::Unreachable {
                    addr: addr.to_owned(),
                    timeout,
                    source,
                })
            }
        }
    }
}

async fn serve(listener: TcpListener, world_size: usize) -> Result<(), CollectiveError> {
    let result = run_store(listener, world_size).await;
    if let Err(err) = &result {
        warn!("rendezvous store stopped: {err}");
    }
    result
}

async fn run_store(listener: TcpListener, world_size: usize) -> Result<(), CollectiveError> {
    let mut joined: Vec<(GroupSpec, Channel)> = Vec::with_capacity(world_size);
    while joined.len() < world_size {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let mut channel = Framed::new(stream, LengthDelimitedCodec::new());
        match recv::<Request>(&mut channel).await {
            Ok(Request::Join(spec)) => {
                debug!(rank = spec.rank, %peer, "member joined ({}/{world_size})", joined.len() + 1);
                joined.push((spec, channel));
            }
            Ok(other) => warn!(%peer, "dropping connection that opened with {}", other.describe()),
            Err(err) => warn!(%peer, "dropping connection that failed to join: {err}"),
        }
    }
    drop(listener);

    let specs: Vec<GroupSpec> = joined.iter().map(|(spec, _)| *spec).collect();
    let mut members: Vec<Channel> = joined
        .into_iter()
        .sorted_by_key(|(spec, _)| spec.rank)
        .map(|(_, channel)| channel)
        .collect();

    if let Err(reason) = validate_members(&specs, world_size) {
        abort_all(&mut members, &reason).await;
        return Err(CollectiveError::Rejected(reason));
    }
    broadcast(&mut members, &Response::Joined).await?;
    info!(world_size, "group formed");

    loop {
        let mut requests = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            match recv::<Request>(&mut members[rank]).await {
                Ok(request) => requests.push(request),
                Err(err) => {
                    let reason = format!("rank {rank} dropped out of the group: {err}");
                    abort_all(&mut members, &reason).await;
                    return Err(CollectiveError::Disconnected(reason));
                }
            }
        }
        match settle_round(requests) {
            Ok(Round::Reply(response)) => broadcast(&mut members, &response).await?,
            Ok(Round::Leave) => {
                // members that already hung up don't need the confirmation
                for channel in members.iter_mut() {
                    let _ = send(channel, &Response::Left).await;
                }
                return Ok(());
            }
            Err(reason) => {
                abort_all(&mut members, &reason).await;
                return Err(CollectiveError::Rejected(reason));
            }
        }
    }
}

fn settle_round(requests: Vec<Request>) -> Result<Round, String> {
    let mismatch = |requests: &[Request]| {
        format!(
            "members issued mismatched collectives: {}",
            requests
                .iter()
                .enumerate()
                .map(|(rank, request)| format!("rank {rank} {}", request.describe()))
                .join(", ")
        )
    };

    match requests.first() {
        Some(Request::Barrier { generation }) => {
            let generation = *generation;
            if requests
                .iter()
                .all(|r| matches!(r, Request::Barrier { generation: g } if *g == generation))
            {
                Ok(Round::Reply(Response::Released { generation }))
            } else {
                Err(mismatch(&requests))
            }
        }
        Some(Request::AllGather { generation, .. }) => {
            let generation = *generation;
            if !requests
                .iter()
                .all(|r| matches!(r, Request::AllGather { generation: g, .. } if *g == generation))
            {
                return Err(mismatch(&requests));
            }
            let payloads = requests
                .into_iter()
                .filter_map(|r| match r {
                    Request::AllGather { payload, .. } => Some(payload),
                    _ => None,
                })
                .collect();
            Ok(Round::Reply(Response::Gathered {
                generation,
                payloads,
            }))
        }
        Some(Request::Leave) if requests.iter().all(|r| matches!(r, Request::Leave)) => {
            Ok(Round::Leave)
        }
        _ => Err(mismatch(&requests)),
    }
}

async fn broadcast(members: &mut [Channel], response: &Response) -> Result<(), CollectiveError> {
    for channel in members.iter_mut() {
        send(channel, response).await?;
    }
    Ok(())
}

async fn abort_all(members: &mut [Channel], reason: &str) {
    let response = Response::Aborted {
        reason: reason.to_owned(),
    };
    for channel in members.iter_mut() {
        if let Err(err) = send(channel, &response).await {
            debug!("could not deliver abort to a member: {err}");
        }
    }
}
