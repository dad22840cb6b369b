use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dvmq::queue::QueueOptions;
use dvmq::Queue;
use verifier_chains::ChainResolver;
use verifier_core::chain::{
    ChainRegistry, EvmChain, EvmChainConfig, SolanaChain, StellarChain,
};
use verifier_core::rpc_clients::{HorizonClient, SolanaRpcClient};
use verifier_core::tokens::{StaticTokenRegistry, TokenInfo, TokenService};
use verifier_executors::scan::{spawn_pending_scan, ScanConfig};
use verifier_executors::verify::VerificationJobHandler;
use verifier_executors::webhook::{WebhookJobHandler, WebhookNotifier, WebhookRetryConfig};

mod api_store;
mod config;

use api_store::ApiDonationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config();

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "donation_verifier=debug,verifier_executors=debug,verifier_chains=debug,dvmq=info"
                .into()
        }),
    );

    match config.worker.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let tokens: Arc<dyn TokenService> =
        Arc::new(StaticTokenRegistry::new(config.tokens.iter().map(|t| {
            (
                t.network_id,
                TokenInfo {
                    symbol: t.symbol.clone(),
                    address: t.address.clone(),
                    decimals: t.decimals,
                },
            )
        })));

    let mut chains = ChainRegistry::new();
    for evm in &config.chains.evm {
        let extra_entry_points = evm
            .extra_entry_points
            .iter()
            .map(|a| a.parse())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                anyhow::anyhow!("bad entry point address on network {}: {e}", evm.network_id)
            })?;

        chains.insert_evm(EvmChain::new(
            &EvmChainConfig {
                network_id: evm.network_id,
                rpc_url: evm.rpc_url.clone(),
                explorer_url: evm.explorer_url.clone(),
                explorer_api_key: evm.explorer_api_key.clone(),
                safe_service_url: evm.safe_service_url.clone(),
                extra_entry_points,
                native_symbol: evm.native_symbol.clone(),
            },
            http.clone(),
        )?);
    }
    for solana in &config.chains.solana {
        chains.insert_solana(SolanaChain {
            network_id: solana.network_id,
            rpc: SolanaRpcClient::new(http.clone(), &solana.rpc_url, solana.network_id)?,
        });
    }
    for stellar in &config.chains.stellar {
        chains.insert_stellar(StellarChain {
            network_id: stellar.network_id,
            horizon: HorizonClient::new(http.clone(), &stellar.horizon_url, stellar.network_id)?,
        });
    }
    let chains = Arc::new(chains);

    let resolver = Arc::new(ChainResolver::new(chains, tokens));
    let store = Arc::new(ApiDonationStore::new(
        http.clone(),
        &config.store.base_url,
        config.store.api_key.clone(),
    ));

    let mut handler = VerificationJobHandler::new(store.clone(), resolver);

    let mut webhook_worker = None;
    if let Some(webhook) = &config.webhook {
        let webhook_queue = Queue::new(
            &config.redis.url,
            "webhook",
            Some(QueueOptions {
                local_concurrency: config.queue.webhook_workers,
                ..Default::default()
            }),
            WebhookJobHandler {
                http_client: http.clone(),
                retry_config: Arc::new(WebhookRetryConfig::default()),
            },
        )
        .await?
        .arc();

        webhook_worker = Some(webhook_queue.work());
        handler = handler.with_notifier(WebhookNotifier {
            queue: webhook_queue,
            url: webhook.url.clone(),
            hmac_secret: webhook.hmac_secret.clone(),
        });
        tracing::info!(url = %webhook.url, "Outcome webhooks enabled");
    }

    let verify_queue = Queue::new(
        &config.redis.url,
        "verify",
        Some(QueueOptions {
            local_concurrency: config.queue.verification_workers,
            ..Default::default()
        }),
        handler,
    )
    .await?
    .arc();

    let verify_worker = verify_queue.work();
    let scanner = spawn_pending_scan(
        store,
        verify_queue.clone(),
        ScanConfig {
            interval: Duration::from_secs(config.queue.scan_interval_secs),
            min_donation_age: Duration::from_secs(config.queue.min_donation_age_secs),
            batch_size: config.queue.scan_batch_size,
        },
    );

    tracing::info!("Donation verifier started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scanner.shutdown().await;
    verify_worker.shutdown().await?;
    if let Some(worker) = webhook_worker {
        worker.shutdown().await?;
    }

    tracing::info!("Donation verifier stopped");
    Ok(())
}
