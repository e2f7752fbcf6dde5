pub mod config;
pub mod evm;
pub mod notify;
pub mod queue;
pub mod rebalance;
pub mod settlement;
pub mod signing;
pub mod store;
pub mod strategies;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use aggregator_client::AggregatorClient;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use chain_signers::{bitcoin_keys::TaprootKeys, handle_background_thread_result, shutdown_signal};
use clap::Parser;
use resilient_providers::{
    BitcoinDataClient, PriceClient, PriceProvider, PriceProviderKind, RetryPolicy,
};
use router_client::RouterClient;
use settler_models::{NetworkType, QueueName};
use snafu::{prelude::*, ResultExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::SettlerConfig;
use crate::evm::{GasOverrides, NonceManager, TransactionExecutor};
use crate::notify::{LogNotifier, Notifier};
use crate::queue::MemoryJobQueue;
use crate::rebalance::{
    spawn_idle_scanner, spawn_status_poller, IdleScannerConfig, RebalanceConfig,
    RebalanceQuoteHandler, RebalanceTransferHandler, RebalancingOrchestrator,
};
use crate::settlement::{
    submit_processor::SubmitProcessor, transfer_processor::TransferProcessor,
    SettlementOrchestrator,
};
use crate::signing::SettlementSigner;
use crate::store::{MemoryRebalancingStore, MemoryTradeStore};
use crate::strategies::{
    BitcoinTransferStrategy, BtcEngineConfig, EvmNetworkCtx, EvmTransferStrategy,
    LiquidationTransferStrategy, LiquidationVaultConfig, SolanaTransferStrategy,
    TransferStrategyFactory,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Configuration error: {}", source))]
    Config { source: config::ConfigError },

    #[snafu(display("Invalid EVM operator key: {}", source))]
    EvmKey {
        source: chain_signers::evm_keys::EvmKeyError,
    },

    #[snafu(display("Invalid Bitcoin key: {}", source))]
    BitcoinKey {
        source: chain_signers::bitcoin_keys::BitcoinKeyError,
    },

    #[snafu(display("Invalid Solana key: {}", source))]
    SolanaKey {
        source: chain_signers::solana_keys::SolanaKeyError,
    },

    #[snafu(display("Router client error: {}", source))]
    Router {
        #[snafu(source(from(router_client::RouterClientError, Box::new)))]
        source: Box<router_client::RouterClientError>,
    },

    #[snafu(display("Aggregator client error: {}", source))]
    Aggregator {
        #[snafu(source(from(aggregator_client::AggregatorClientError, Box::new)))]
        source: Box<aggregator_client::AggregatorClientError>,
    },

    #[snafu(display("Provider setup error: {}", source))]
    BitcoinProviders {
        source: resilient_providers::BitcoinDataError,
    },

    #[snafu(display("Price provider setup error: {}", source))]
    PriceProviders {
        source: resilient_providers::PriceError,
    },

    #[snafu(display("Strategy setup error: {}", source))]
    Strategy {
        source: crate::strategies::TransferError,
    },

    #[snafu(display("Invalid argument {name}: {reason}"))]
    InvalidArg { name: String, reason: String },

    #[snafu(display("Background task error: {}", source))]
    BackgroundTask {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Parser, Debug, Clone)]
#[command(name = "pmm-settler")]
#[command(about = "Market-maker settlement engine")]
pub struct SettlerArgs {
    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Path to the network/rebalance config TOML
    #[arg(long, env = "SETTLER_CONFIG", default_value = "settler.toml")]
    pub config_path: String,

    /// This PMM's identity (0x-prefixed hex, at most 32 bytes)
    #[arg(long, env = "PMM_ID")]
    pub pmm_id: String,

    /// Router/solver base URL
    #[arg(long, env = "ROUTER_URL")]
    pub router_url: String,

    /// Swap aggregator base URL
    #[arg(long, env = "AGGREGATOR_URL")]
    pub aggregator_url: String,

    /// Exchange-style price oracle base URL
    #[arg(long, env = "PRICE_EXCHANGE_URL")]
    pub price_exchange_url: String,

    /// Simple-price-style oracle base URL
    #[arg(long, env = "PRICE_SIMPLE_URL")]
    pub price_simple_url: String,

    /// EVM operator private key (hex)
    #[arg(long, env = "EVM_OPERATOR_KEY")]
    pub evm_operator_key: String,

    /// Bitcoin wallet private key (WIF)
    #[arg(long, env = "BITCOIN_WIF")]
    pub bitcoin_wif: String,

    /// Solana keypair (base58), required when the config enables Solana
    #[arg(long, env = "SOLANA_KEYPAIR")]
    pub solana_keypair: Option<String>,

    /// Nonce cache resync interval in seconds
    #[arg(long, env = "NONCE_REFRESH_SECS", default_value = "60")]
    pub nonce_refresh_secs: u64,

    /// Rebalance status poll interval in seconds
    #[arg(long, env = "REBALANCE_POLL_SECS", default_value = "30")]
    pub rebalance_poll_secs: u64,

    /// Idle balance scan interval in seconds
    #[arg(long, env = "BALANCE_SCAN_SECS", default_value = "300")]
    pub balance_scan_secs: u64,
}

/// The wired daemon. The settlement orchestrator is exposed so the (out of
/// scope here) transport layer can drive commit/ack/signal operations; the
/// queue processors and schedulers run on the internal join set.
pub struct Settler {
    orchestrator: Arc<SettlementOrchestrator>,
    join_set: JoinSet<Result<()>>,
    cancellation_token: CancellationToken,
}

impl Settler {
    pub async fn build(args: SettlerArgs) -> Result<Self> {
        let settings = SettlerConfig::load(&args.config_path).context(ConfigSnafu)?;
        let cancellation_token = CancellationToken::new();
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        info!(pmm_id = args.pmm_id, "starting settlement engine");

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let queue = MemoryJobQueue::new();
        let trade_store = Arc::new(MemoryTradeStore::new());
        let rebalancing_store = Arc::new(MemoryRebalancingStore::new());

        // Keys
        let btc_network = settings.bitcoin.parse_network().context(ConfigSnafu)?;
        let taproot = TaprootKeys::from_wif(&args.bitcoin_wif, btc_network)
            .context(BitcoinKeySnafu)?;
        let btc_address = taproot.address.to_string();
        let operator =
            chain_signers::evm_keys::signer_from_hex(&args.evm_operator_key).context(EvmKeySnafu)?;
        let operator_address = operator.address();

        // Clients
        let router_url = args.router_url.parse().map_err(|e| Error::InvalidArg {
            name: "router_url".to_string(),
            reason: format!("{e}"),
        })?;
        let router = Arc::new(RouterClient::new(router_url).context(RouterSnafu)?);
        let aggregator_url = args.aggregator_url.parse().map_err(|e| Error::InvalidArg {
            name: "aggregator_url".to_string(),
            reason: format!("{e}"),
        })?;
        let aggregator = Arc::new(AggregatorClient::new(aggregator_url).context(AggregatorSnafu)?);
        let bitcoin_data = Arc::new(
            BitcoinDataClient::new(&settings.bitcoin.provider_urls, RetryPolicy::default())
                .context(BitcoinProvidersSnafu)?,
        );
        let price_client = Arc::new(
            PriceClient::new(
                vec![
                    PriceProvider::new(&args.price_exchange_url, PriceProviderKind::ExchangeTicker)
                        .context(PriceProvidersSnafu)?,
                    PriceProvider::new(&args.price_simple_url, PriceProviderKind::SimplePrice)
                        .context(PriceProvidersSnafu)?,
                ],
                RetryPolicy::default(),
            )
            .context(PriceProvidersSnafu)?,
        );

        // Signature domain: bound to the router contract on the primary EVM
        // network.
        let router_contract = router.get_router().await.context(RouterSnafu)?;
        let router_contract =
            Address::from_str(&router_contract).map_err(|e| Error::InvalidArg {
                name: "router contract".to_string(),
                reason: format!("{e}"),
            })?;
        let primary_chain_id = settings.evm_networks.first().map(|n| n.chain_id).unwrap_or(1);
        let settlement_signer = Arc::new(SettlementSigner::new(
            operator.clone(),
            primary_chain_id,
            router_contract,
        ));

        // EVM networks: one signing provider + executor per network, a
        // shared nonce cache with periodic resync.
        let nonce_manager = Arc::new(NonceManager::new(operator_address));
        let mut evm_networks: HashMap<String, Arc<EvmNetworkCtx>> = HashMap::new();
        let mut liquidation_vaults: HashMap<String, LiquidationVaultConfig> = HashMap::new();
        for network in &settings.evm_networks {
            let rpc_url = network.rpc_url.parse().map_err(|e| Error::InvalidArg {
                name: format!("evm_networks[{}].rpc_url", network.network_id),
                reason: format!("{e}"),
            })?;
            let provider = ProviderBuilder::new()
                .wallet(EthereumWallet::from(operator.clone()))
                .connect_http(rpc_url)
                .erased();
            nonce_manager.register_network(&network.network_id, provider.clone());

            let executor = Arc::new(TransactionExecutor::new(
                provider.clone(),
                nonce_manager.clone(),
                &network.network_id,
            ));
            let gas_overrides = GasOverrides {
                max_gas_price: network
                    .max_gas_price_gwei
                    .map(|gwei| U256::from(gwei) * U256::from(1_000_000_000u64)),
                ..Default::default()
            };
            evm_networks.insert(
                network.network_id.clone(),
                Arc::new(EvmNetworkCtx {
                    provider,
                    executor,
                    gas_overrides,
                }),
            );

            if let Some(vault) = &network.liquidation_vault {
                let vault = Address::from_str(vault).map_err(|e| Error::InvalidArg {
                    name: format!("evm_networks[{}].liquidation_vault", network.network_id),
                    reason: format!("{e}"),
                })?;
                let approvers = network
                    .liquidation_approver_keys
                    .iter()
                    .map(|key| chain_signers::evm_keys::signer_from_hex(key))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .context(EvmKeySnafu)?;
                liquidation_vaults.insert(
                    network.network_id.clone(),
                    LiquidationVaultConfig { vault, approvers },
                );
            }
        }
        nonce_manager
            .spawn_refresh_loop(Duration::from_secs(args.nonce_refresh_secs), &mut join_set);

        // Transfer strategies
        let mut factory = TransferStrategyFactory::new();
        if !evm_networks.is_empty() {
            let evm_strategy = Arc::new(EvmTransferStrategy::new(
                evm_networks.clone(),
                router.clone(),
                notifier.clone(),
                operator_address,
            ));
            factory.register_all_trade_types(NetworkType::Evm, evm_strategy);
        }
        if !liquidation_vaults.is_empty() {
            let liquidation = Arc::new(
                LiquidationTransferStrategy::new(
                    evm_networks.clone(),
                    liquidation_vaults,
                    notifier.clone(),
                )
                .context(StrategySnafu)?,
            );
            factory.register(NetworkType::Evm, settler_models::TradeType::Liquid, liquidation);
        }

        let btc_strategy = Arc::new(BitcoinTransferStrategy::new(
            taproot,
            bitcoin_data.clone(),
            notifier.clone(),
            BtcEngineConfig {
                allow_unconfirmed: settings.bitcoin.allow_unconfirmed,
                max_fee_rate: settings.bitcoin.max_fee_rate,
            },
        ));
        factory.register_all_trade_types(NetworkType::Btc, btc_strategy.clone());
        factory.register_all_trade_types(NetworkType::Tbtc, btc_strategy.clone());

        let mut recv_addresses = HashMap::new();
        recv_addresses.insert(NetworkType::Evm, operator_address.to_string());
        recv_addresses.insert(NetworkType::Btc, btc_address.clone());
        recv_addresses.insert(NetworkType::Tbtc, btc_address.clone());

        if let Some(solana) = &settings.solana {
            let keypair_encoded =
                args.solana_keypair
                    .as_deref()
                    .ok_or_else(|| Error::InvalidArg {
                        name: "solana_keypair".to_string(),
                        reason: "config enables Solana but no keypair was provided".to_string(),
                    })?;
            let keypair = Arc::new(
                chain_signers::solana_keys::keypair_from_base58(keypair_encoded)
                    .context(SolanaKeySnafu)?,
            );
            use solana_sdk::signer::Signer as _;
            recv_addresses.insert(NetworkType::Solana, keypair.pubkey().to_string());

            let program_id = solana_sdk::pubkey::Pubkey::from_str(&solana.program_id)
                .map_err(|e| Error::InvalidArg {
                    name: "solana.program_id".to_string(),
                    reason: format!("{e}"),
                })?;
            let fee_vault = solana_sdk::pubkey::Pubkey::from_str(&solana.fee_vault).map_err(
                |e| Error::InvalidArg {
                    name: "solana.fee_vault".to_string(),
                    reason: format!("{e}"),
                },
            )?;
            let rpc = Arc::new(solana_client::nonblocking::rpc_client::RpcClient::new(
                solana.rpc_url.clone(),
            ));
            let solana_strategy = Arc::new(SolanaTransferStrategy::new(
                rpc,
                keypair,
                program_id,
                fee_vault,
                router.clone(),
                notifier.clone(),
            ));
            factory.register_all_trade_types(NetworkType::Solana, solana_strategy);
        }
        let factory = Arc::new(factory);

        // Settlement pipeline
        let orchestrator = Arc::new(SettlementOrchestrator::new(
            &args.pmm_id,
            router.clone(),
            trade_store.clone(),
            queue.clone(),
            settlement_signer.clone(),
            recv_addresses,
        ));

        for queue_name in [
            QueueName::TransferEvm,
            QueueName::TransferBtc,
            QueueName::TransferSolana,
        ] {
            let processor = Arc::new(TransferProcessor::new(
                queue_name,
                &args.pmm_id,
                router.clone(),
                trade_store.clone(),
                factory.clone(),
                queue.clone(),
                notifier.clone(),
            ));
            queue.register_worker(processor, &mut join_set);
        }
        queue.register_worker(
            Arc::new(SubmitProcessor::new(
                &args.pmm_id,
                router.clone(),
                trade_store.clone(),
                settlement_signer,
            )),
            &mut join_set,
        );

        // Rebalancing pipeline
        let rebalancer = Arc::new(RebalancingOrchestrator::new(
            rebalancing_store.clone(),
            aggregator,
            price_client,
            btc_strategy,
            queue.clone(),
            notifier.clone(),
            RebalanceConfig {
                slippage_threshold_bps: settings.rebalance.slippage_threshold_bps,
                refund_address: btc_address.clone(),
                vault_recipient: settings.rebalance.vault_recipient.clone(),
                to_asset: settings.rebalance.to_asset.clone(),
            },
        ));
        queue.register_worker(Arc::new(RebalanceQuoteHandler(rebalancer.clone())), &mut join_set);
        queue.register_worker(
            Arc::new(RebalanceTransferHandler(rebalancer.clone())),
            &mut join_set,
        );
        spawn_status_poller(
            rebalancer,
            Duration::from_secs(args.rebalance_poll_secs),
            &mut join_set,
        );
        spawn_idle_scanner(
            rebalancing_store,
            queue.clone(),
            notifier,
            bitcoin_data,
            btc_address,
            IdleScannerConfig {
                min_idle_sats: settings.rebalance.min_idle_sats,
                scan_interval: Duration::from_secs(args.balance_scan_secs),
                max_retry_window: chrono::Duration::hours(settings.rebalance.max_retry_hours),
            },
            &mut join_set,
        );

        Ok(Self {
            orchestrator,
            join_set,
            cancellation_token,
        })
    }

    /// Settlement operations surface for the transport layer.
    pub fn settlement(&self) -> Arc<SettlementOrchestrator> {
        self.orchestrator.clone()
    }

    pub async fn run(mut self) -> Result<()> {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
            }
            task_end = self.join_set.join_next() => {
                info!("Background task exited: {:?}", handle_background_thread_result(task_end));
            }
        }

        info!("Triggering graceful shutdown...");
        self.cancellation_token.cancel();
        self.join_set.abort_all();
        while self.join_set.join_next().await.is_some() {}
        info!("All background tasks have been shut down");

        Ok(())
    }
}

pub async fn run_settler(args: SettlerArgs) -> Result<()> {
    Settler::build(args).await?.run().await
}
