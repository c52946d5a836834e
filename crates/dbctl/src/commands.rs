//! Command implementations. Results are printed to stdout as JSON.

use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use helios_load_balancing::postgres::{PgNode, PgNodeFactory, PostgresConfig, create_pool};
use helios_load_balancing::{DnsResolver, LoadBalancer, Resolver, ServiceDiscovery};
use helios_reindexing::postgres::{PgLease, PgReindexDatabase, PgReindexHistory};
use helios_reindexing::{
    Coordinator, GrafanaNotifier, Notifier, NullNotifier, ReindexDatabase, Reindexing,
    ReindexingConfig, build_strategy,
};

use crate::cli::split_index;
use crate::settings::Settings;

/// Everything a command needs.
#[derive(Debug, Clone)]
pub struct Context {
    /// Connection settings of the primary.
    pub primary: PostgresConfig,
    /// Library configurations.
    pub settings: Settings,
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wires the PostgreSQL catalog, history, lease and notifier into a runner.
async fn reindexing(
    primary: &PostgresConfig,
    config: &ReindexingConfig,
) -> anyhow::Result<(Arc<PgReindexDatabase>, Reindexing)> {
    let pool = create_pool(primary)?;
    let database = Arc::new(PgReindexDatabase::new(pool.clone()));
    let history = Arc::new(PgReindexHistory::new(pool.clone()));
    let lease = Arc::new(PgLease::new(pool));
    history.ensure_table().await?;
    lease.ensure_table().await?;

    let notifier: Arc<dyn Notifier> = if config.notifier.enabled() {
        Arc::new(GrafanaNotifier::new(config.notifier.clone())?)
    } else {
        Arc::new(NullNotifier)
    };

    let strategy = build_strategy(database.clone(), config);
    info!(strategy = strategy.name(), "Using rebuild strategy");
    let coordinator = Coordinator::new(
        database.clone(),
        strategy,
        lease,
        history.clone(),
        notifier,
        config,
    );
    let reindexing = Reindexing::new(database.clone(), coordinator, history, config);
    Ok((database, reindexing))
}

/// Runs automatic reindexing, or lists the candidates.
pub async fn reindex(ctx: &Context, dry_run: bool) -> anyhow::Result<()> {
    let (_, reindexing) = reindexing(&ctx.primary, &ctx.settings.reindexing).await?;

    if dry_run {
        let candidates: Vec<_> = reindexing
            .candidates()
            .await?
            .into_iter()
            .map(|index| {
                json!({
                    "index": index.identifier(),
                    "table": index.table,
                    "ondisk_size_bytes": index.ondisk_size_bytes,
                    "bloat_size_bytes": index.bloat_size_bytes,
                    "relative_bloat": index.relative_bloat(),
                })
            })
            .collect();
        return print(&candidates);
    }

    let report = reindexing.automatic_reindexing().await?;
    print(&report)
}

/// Reports replacement leftovers and drops `_ccnew` leftovers.
pub async fn cleanup_leftovers(ctx: &Context) -> anyhow::Result<()> {
    let (_, reindexing) = reindexing(&ctx.primary, &ctx.settings.reindexing).await?;

    let recovery = reindexing.recovery_check().await?;
    let (dropped, stopped) = reindexing.cleanup_leftovers().await?;
    print(&json!({
        "recovery": recovery,
        "dropped": dropped,
        "stopped": stopped,
    }))
}

/// Drops one index under the reindexing lease.
pub async fn drop_index(ctx: &Context, index: &str) -> anyhow::Result<()> {
    let (schema, name) =
        split_index(index).with_context(|| format!("Invalid index name '{index}'"))?;
    let (database, reindexing) = reindexing(&ctx.primary, &ctx.settings.reindexing).await?;

    let target = {
        let mut conn = database.connect().await?;
        conn.find_index(schema, name)
            .await?
            .with_context(|| format!("Index {schema}.{name} does not exist"))?
    };

    let outcome = reindexing.coordinator().drop(&target).await?;
    print(&json!({
        "index": target.identifier(),
        "dropped": outcome.stop_reason().is_none(),
        "stopped": outcome.stop_reason(),
    }))
}

/// Resolves the discovery record once.
pub async fn discover(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx
        .settings
        .load_balancing
        .discover
        .as_ref()
        .context("load_balancing.discover is not configured")?;

    let resolution = DnsResolver::new(config).await?.resolve().await?;
    let addresses: Vec<String> = resolution.addresses.iter().map(ToString::to_string).collect();
    print(&json!({
        "record": config.record,
        "record_type": config.record_type,
        "addresses": addresses,
        "ttl_secs": resolution.ttl.as_secs(),
    }))
}

/// Refreshes and prints the health of every replica.
pub async fn replicas(ctx: &Context) -> anyhow::Result<()> {
    let config = ctx.settings.load_balancing.clone();
    let primary = Arc::new(PgNode::connect_to(&ctx.primary)?);
    let factory = Arc::new(PgNodeFactory::new(ctx.primary.clone(), config.pool_size));
    let load_balancer = Arc::new(LoadBalancer::from_config(
        primary,
        factory.as_ref(),
        config.clone(),
    )?);

    if let Some(discover) = &config.discover {
        let resolver = Arc::new(DnsResolver::new(discover).await?);
        ServiceDiscovery::new(load_balancer.clone(), resolver, factory, discover.clone())
            .refresh_if_necessary()
            .await?;
    }

    let mut rows = Vec::new();
    for host in load_balancer.host_list().hosts() {
        host.refresh_status().await;
        let status = host.status();
        rows.push(json!({
            "address": status.address,
            "online": status.online,
            "lag_time_ms": status.lag_time.map(|d| d.as_millis() as u64),
            "lag_size_bytes": status.lag_size,
            "busy_connections": status.busy_connections,
        }));
    }
    print(&rows)
}
