use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, instrument, warn};

use crate::config::{Config, SchedulerMode, StartBlockNumber};
use crate::crawler::Crawler;
use crate::database::methods::DbMethods;
use crate::database::types::SystemHealth;
use crate::database::{Database, WriteStrategy};
use crate::ethereum::subscriber::HeadSubscriber;
use crate::ethereum::EthereumGateway;
use crate::publisher::{EventSink, JetStreamPublisher};
use crate::scheduler::Scheduler;
use crate::shutdown::Shutdown;

pub struct App {
    pub config: Config,
    pub database: Arc<Database>,
    pub gateway: Arc<EthereumGateway>,
    pub crawler: Arc<Crawler>,
    pub scheduler: Arc<Scheduler>,
}

impl App {
    /// Wire the collaborators together: document store, chain gateway,
    /// optional event publisher, crawler and scheduler. The scheduler cursor
    /// resumes after the last processed block when the store has history.
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config, shutdown: Shutdown) -> anyhow::Result<Arc<Self>> {
        let network = config.app.network.clone();

        let database = Arc::new(
            Database::new(&config.database, WriteStrategy::from(&config.crawler)).await?,
        );
        database.init_indexes().await?;

        let gateway = Arc::new(EthereumGateway::new(
            config.ethereum.clone(),
            network.clone(),
        ));
        gateway.connect().await?;
        let tip = gateway.health_check().await?;

        if let Err(error) = database
            .record_system_health(&SystemHealth::healthy(
                "ethereum_gateway",
                format!("connected at tip {tip}"),
            ))
            .await
        {
            warn!(?error, "failed to record startup health");
        }

        let events: Option<Arc<dyn EventSink>> = match &config.events {
            Some(events_config) if events_config.enabled => {
                match JetStreamPublisher::connect(events_config).await {
                    Ok(publisher) => Some(Arc::new(publisher)),
                    Err(error) => {
                        warn!(
                            ?error,
                            "event stream unavailable, continuing without a publisher"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let crawler = Arc::new(Crawler::new(
            gateway.clone(),
            database.clone(),
            events,
            config.crawler.clone(),
            network.clone(),
        ));

        let start_block = match database.last_processed_block(&network).await? {
            Some(block) => {
                let last: u64 = block.number.parse().with_context(|| {
                    format!("stored block number {:?} is not numeric", block.number)
                })?;
                info!(last_processed = last, "resuming after the last processed block");
                last + 1
            }
            None => match config.app.start_block_number {
                StartBlockNumber::Number(number) => number,
                StartBlockNumber::Latest => tip,
            },
        };

        let subscriber = match (config.scheduler.mode, &config.ethereum.ws_url) {
            (SchedulerMode::Realtime | SchedulerMode::Hybrid, Some(ws_url)) => {
                Some(Arc::new(HeadSubscriber::new(
                    ws_url.clone(),
                    config.scheduler.reconnect_attempts,
                    config.scheduler.reconnect_delay,
                )))
            }
            _ => None,
        };

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            config.crawler.clone(),
            crawler.clone(),
            gateway.clone(),
            database.clone(),
            subscriber,
            start_block,
            network,
            shutdown,
        )?);

        Ok(Arc::new(Self {
            config,
            database,
            gateway,
            crawler,
            scheduler,
        }))
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
        self.gateway.disconnect().await;
    }
}
