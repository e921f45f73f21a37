//! Service assembly: configuration, telemetry, stores, the delivery
//! pipeline, the session gateway, and the REST facade, torn down in order on
//! SIGTERM/SIGINT.

mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Extension;
use relay_auth::TokenVerifier;
use relay_chat::ChatService;
use relay_config::AppConfig;
use relay_dal::{
    CacheHandle, DbPools, MemoryDatastore, MemoryResultCache, PgDatastore, RedisResultCache,
    ReplicaBreaker, ReplicaLagMonitor, SharedDatastore,
};
use relay_gateway::{Gateway, GatewayConfig, SessionRegistry, spawn_fanout_host};
use relay_idempotency::AckCache;
use relay_pipeline::{
    ConsumerConfig, ConsumerWorker, Producer, ProducerConfig, RateLimit, SenderRateLimiter,
    fanout_channel,
};
use relay_presence::{MemoryPresence, RedisPresence, SharedPresence};
use relay_replay::{ReplayCache, ReplayCacheConfig};
use relay_stream::{JetStreamLog, MemoryLog, SharedLog};
use relay_telemetry::{TelemetryConfig, init_telemetry};
use tokio::sync::watch;
use tracing::{info, warn};

pub use http::{AppState, router};

const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const ACK_CACHE_TTL: Duration = Duration::from_secs(300);
const FANOUT_QUEUE_CAPACITY: usize = 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env().context("configuration invalid")?;

    let prometheus = init_telemetry(&TelemetryConfig {
        service_name: "relay-chatd".into(),
        level: config.log_level.as_filter().into(),
        json_logs: config.log_json,
        prometheus: true,
    })?;
    info!(env = config.env.as_str(), port = config.port, "starting chatd");

    let breaker = Arc::new(ReplicaBreaker::new(
        config.replica.lag_warning_secs,
        config.replica.lag_critical_secs,
        BREAKER_COOLDOWN,
    ));

    // Stores. Mock mode (non-production only) swaps every external
    // collaborator for its in-memory peer.
    let (store, pools): (SharedDatastore, Option<DbPools>) = if config.mock_mode {
        warn!("MOCK_MODE: using in-memory datastore");
        let memory = Arc::new(MemoryDatastore::new());
        if config.dev_seed_data {
            seed_dev_data(&memory).await;
        }
        (memory, None)
    } else {
        let pools = DbPools::connect(&config.database, &config.replica, breaker.clone())
            .context("database pool setup")?;
        let cache = if config.cache.redis_enabled {
            let url = config
                .cache
                .redis_url
                .as_deref()
                .context("REDIS_URL required for the result cache")?;
            let redis = RedisResultCache::connect(url, "relay")
                .await
                .context("result cache connect")?;
            CacheHandle::new(Arc::new(redis), config.cache.bypass)
        } else {
            CacheHandle::new(Arc::new(MemoryResultCache::new()), config.cache.bypass)
        };
        let datastore = PgDatastore::new(pools.clone(), cache);
        datastore
            .ensure_schema()
            .await
            .context("schema migration")?;
        pools.spawn_metrics_sampler(Duration::from_secs(10));
        (Arc::new(datastore), Some(pools))
    };

    let lag_monitor = match (&pools, config.replica.enabled) {
        (Some(pools), true) => {
            let monitor = Arc::new(ReplicaLagMonitor::new(
                pools.primary().clone(),
                config.replica.lag_warning_secs,
                breaker.clone(),
            ));
            monitor.clone().spawn(config.replica.lag_poll_interval);
            Some(monitor)
        }
        _ => None,
    };

    // Presence: Redis when the socket adapter is enabled, in-memory
    // otherwise (single instance).
    let presence: SharedPresence = match (&config.socket.redis_url, config.socket.adapter_enabled)
    {
        (Some(url), true) if !config.socket_redis_mock => {
            let registry = Arc::new(
                RedisPresence::connect(
                    url,
                    config.socket.redis_key_prefix.clone(),
                    config.socket.presence_ttl,
                )
                .await
                .context("presence store connect")?,
            );
            spawn_redis_presence_sweeper(registry.clone(), config.socket.heartbeat_interval);
            registry
        }
        _ => {
            let registry = Arc::new(MemoryPresence::new(config.socket.presence_ttl));
            registry.spawn_sweeper(config.socket.heartbeat_interval);
            registry
        }
    };

    // Durable log.
    let log: SharedLog = if config.mock_mode {
        Arc::new(MemoryLog::new(
            config.stream.partitions,
            config.stream.poll_interval,
        ))
    } else {
        let nats = async_nats::connect(&config.stream.nats_url)
            .await
            .context("nats connect")?;
        Arc::new(
            JetStreamLog::connect(nats, &config.stream.subject_prefix, config.stream.partitions)
                .await
                .context("jetstream setup")?,
        )
    };

    let replay = Arc::new(ReplayCache::new(ReplayCacheConfig {
        ttl: config.socket.replay_ttl,
        max_messages: config.socket.replay_max_messages,
    }));

    let limiter = if config.disable_rate_limit {
        warn!("DISABLE_RATE_LIMIT: producer rate limiting is off");
        None
    } else {
        Some(SenderRateLimiter::new(RateLimit::default()))
    };
    let producer = Producer::new(
        store.clone(),
        log.clone(),
        AckCache::new(ACK_CACHE_TTL),
        limiter,
        ProducerConfig {
            partitions: config.stream.partitions,
            max_content_bytes: config.message_max_bytes,
            pending_high_water: config.stream.pending_high_water,
        },
    );

    // One consumer per partition; horizontal scale adds partitions, not
    // consumers per partition.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fanout_tx, fanout_rx) = fanout_channel(FANOUT_QUEUE_CAPACITY);
    let mut consumer_handles = Vec::with_capacity(config.stream.partitions as usize);
    for partition in 0..config.stream.partitions {
        let worker = ConsumerWorker::new(
            log.clone(),
            store.clone(),
            replay.clone(),
            fanout_tx.clone(),
            ConsumerConfig {
                partition,
                batch_size: config.stream.batch_size,
                poll_interval: config.stream.poll_interval,
                max_retries: config.stream.max_retries,
                stream_name: "relay-messages".into(),
            },
        );
        consumer_handles.push(worker.spawn(shutdown_rx.clone()));
    }
    drop(fanout_tx);

    let registry = Arc::new(SessionRegistry::new());
    let fanout_host = spawn_fanout_host(registry.clone(), store.clone(), fanout_rx);

    let verifier = Arc::new(
        TokenVerifier::from_config(&config.auth)
            .map_err(|err| anyhow::anyhow!("verifier setup: {err}"))?,
    );
    let chat = Arc::new(ChatService::new(store.clone()));
    let gateway = Gateway::new(
        verifier.clone(),
        producer.clone(),
        chat.clone(),
        store.clone(),
        presence.clone(),
        replay.clone(),
        registry.clone(),
        GatewayConfig {
            heartbeat_interval: config.socket.heartbeat_interval,
            heartbeat_grace: config.socket.heartbeat_grace,
            auth_timeout: Duration::from_secs(5),
            dedupe_capacity: 200,
            instance_id: config.socket.instance_id.clone(),
        },
    );

    let state = AppState {
        chat,
        producer,
        store,
        verifier,
        registry,
        prometheus,
        pools: pools.clone(),
        lag_monitor,
    };
    let app = router(state)
        .layer(Extension(gateway))
        .layer(Extension(relay_gateway::ShutdownSignal(shutdown_rx.clone())));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(%addr, "chatd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    // Drain: the watch flipped inside `shutdown_signal`, sessions close and
    // consumers finish acknowledging their current batch before exiting.
    for handle in consumer_handles {
        let _ = handle.await;
    }
    let _ = fanout_host.await;
    info!("chatd stopped cleanly");
    Ok(())
}

/// Seeds two users and a direct conversation so a fresh dev instance is
/// usable immediately.
async fn seed_dev_data(store: &MemoryDatastore) {
    use relay_core::{
        Conversation, ConversationId, ConversationKind, ConversationMember, MemberRole, UserId,
    };
    use relay_dal::ConversationStore;

    let now = time::OffsetDateTime::now_utc();
    for user in ["dev-user-1", "dev-user-2"] {
        store.add_user(UserId::from(user));
    }
    let conversation = ConversationId::from("conv-dev-direct");
    let result = store
        .create_conversation(
            Conversation {
                id: conversation.clone(),
                kind: ConversationKind::Direct,
                title: None,
                description: None,
                is_active: true,
                created_at: now,
                last_message_id: None,
                last_message_at: None,
            },
            ["dev-user-1", "dev-user-2"]
                .into_iter()
                .enumerate()
                .map(|(i, user)| ConversationMember {
                    conversation_id: conversation.clone(),
                    user_id: UserId::from(user),
                    role: if i == 0 {
                        MemberRole::Owner
                    } else {
                        MemberRole::Member
                    },
                    is_active: true,
                    joined_at: now,
                })
                .collect(),
        )
        .await;
    if result.is_ok() {
        info!("seeded dev users and conversation conv-dev-direct");
    }
}

fn spawn_redis_presence_sweeper(registry: Arc<RedisPresence>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(500)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(err) = registry.sweep_once().await {
                warn!(error = %err, "presence sweep failed");
            }
        }
    });
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
}
