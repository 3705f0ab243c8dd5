use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Request, Response, StatusCode};
use raft::eraftpb::Message;
use tokio::sync::mpsc::Receiver;

use crate::config::RuntimeConfig;
use crate::correlation::Registry;
use crate::http::{self, Router};
use crate::metrics;
use crate::raft::RaftNode;
use crate::service::RosterService;
use crate::state_machine::RosterStateMachine;
use crate::store::memory::{MemoryCache, MemoryStore};
use crate::store::mysql::MySqlStore;
use crate::store::redis::RedisCache;
use crate::store::{DurableStore, EntityCache, TieredStore};

const JOIN_ATTEMPTS: u32 = 5;
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

fn join_uri(join_addr: &str, node_id: &str, raft_addr: &str) -> String {
    format!(
        "http://{}/join?peerID={}&peerAddr={}",
        join_addr,
        urlencoding::encode(node_id),
        urlencoding::encode(raft_addr)
    )
}

pub struct Server {
    config: RuntimeConfig,
    service: Option<Arc<RosterService>>,
}

impl Server {
    pub fn new(config: RuntimeConfig) -> Self {
        Server {
            config,
            service: None,
        }
    }

    pub async fn start(&mut self) -> anyhow::Result<()> {
        metrics::init_registry();

        let (cache, durable) = self.connect_tiers().await?;
        let store = Arc::new(TieredStore::new(
            cache,
            durable,
            self.config.cache_ttl(),
            self.config.tier_timeout(),
        ));
        match store.preload(self.config.storage.preload_limit).await {
            Ok(loaded) => log::info!("preloaded {} students into the cache", loaded),
            Err(e) => log::warn!("cache preload failed: {}", e),
        }

        let timeouts = self.config.timeouts();
        let registry = Arc::new(Registry::new(self.config.registry_shards, timeouts.total * 2));
        let state_machine = Arc::new(RosterStateMachine::new(store.clone(), registry.clone()));
        let (engine, mailboxes) =
            RaftNode::start(self.config.node_options(), state_machine.clone()).await?;
        Self::start_run_out_message(mailboxes.outbound);

        let service = Arc::new(RosterService::new(
            Arc::new(engine),
            registry,
            store,
            state_machine,
            timeouts,
        ));
        self.start_http_server(service.clone())?;
        self.start_metrics_server()?;
        self.service = Some(service);

        if !self.config.bootstrap {
            if let Some(join_addr) = self.config.join_addr.clone() {
                self.request_join(join_addr);
            }
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.service = None;
        log::info!("server stop");
    }

    async fn connect_tiers(&self) -> anyhow::Result<(Arc<dyn EntityCache>, Arc<dyn DurableStore>)> {
        let storage = &self.config.storage;
        let cache: Arc<dyn EntityCache> = match &storage.redis_url {
            Some(url) => Arc::new(
                RedisCache::connect(url)
                    .await
                    .with_context(|| format!("connecting to redis at {}", url))?,
            ),
            None => {
                log::warn!("no redis_url configured, caching in memory");
                Arc::new(MemoryCache::new())
            }
        };
        let durable: Arc<dyn DurableStore> = match &storage.database_url {
            Some(url) => Arc::new(
                MySqlStore::connect(url)
                    .await
                    .context("connecting to the database")?,
            ),
            None => {
                log::warn!("no database_url configured, keeping durable records in memory");
                Arc::new(MemoryStore::new())
            }
        };
        Ok((cache, durable))
    }

    fn start_http_server(&self, service: Arc<RosterService>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.http_addr)
            .with_context(|| format!("binding http address {}", self.config.http_addr))?;
        http::spawn_server(listener, Arc::new(Router::new(service)))?;
        Ok(())
    }

    fn start_metrics_server(&self) -> anyhow::Result<()> {
        let addr = self
            .config
            .metrics_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("parsing metrics address {}", self.config.metrics_addr))?;
        let make_svc = make_service_fn(move |_| async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| async move {
                let response = match metrics::render() {
                    Ok(buffer) => Response::new(Body::from(buffer)),
                    Err(e) => {
                        let mut response = Response::new(Body::from(e.to_string()));
                        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                        response
                    }
                };
                Ok::<_, hyper::Error>(response)
            }))
        });
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server failed: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }

    /// Drains the node's outbound consensus messages. Peer transport is not part
    /// of this service, so messages for other nodes are dropped here and no
    /// peer is ever linked: this node refuses every join.
    fn start_run_out_message(mut out_mailbox: Receiver<Message>) {
        log::warn!("no consensus transport, joins will be refused");
        tokio::spawn(async move {
            while let Some(msg) = out_mailbox.recv().await {
                log::trace!(
                    "no consensus transport, dropping {:?} for peer {}",
                    msg.get_msg_type(),
                    msg.to
                );
            }
        });
    }

    /// Asks the member at `join_addr` to admit this node, retrying while it is
    /// unreachable or between leaders.
    fn request_join(&self, join_addr: String) {
        let uri = join_uri(&join_addr, &self.config.node_id, &self.config.raft_addr);
        tokio::spawn(async move {
            let client = Client::new();
            for attempt in 1..=JOIN_ATTEMPTS {
                let uri = match uri.parse::<hyper::Uri>() {
                    Ok(uri) => uri,
                    Err(e) => {
                        log::error!("invalid join address {}: {}", join_addr, e);
                        return;
                    }
                };
                match client.get(uri).await {
                    Ok(response) if response.status().is_success() => {
                        log::info!("joined the cluster through {}", join_addr);
                        return;
                    }
                    Ok(response) => log::warn!(
                        "join attempt {} through {} answered {}",
                        attempt,
                        join_addr,
                        response.status()
                    ),
                    Err(e) => log::warn!("join attempt {} through {} failed: {}", attempt, join_addr, e),
                }
                tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
            }
            log::error!("giving up joining the cluster through {}", join_addr);
        });
    }
}
