//! Lifecycle controller for one listener instance.
//!
//! A listener owns two timer chains over one store: the poll chain claims
//! records and publishes them on the event channel, the reap chain returns
//! expired claims to the pool. Both start and stop together, and both are
//! idempotent.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::chain::TimerChain;
use super::enqueue::{Enqueuer, SendOutcome};
use super::poller::{ClaimPoller, PollOutcome};
use super::reaper::{LeaseReaper, ReapOutcome};
use crate::config::QueueConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::{self, EventReceiver};
use crate::model::OwnerToken;
use crate::store::RecordStore;

pub struct Listener {
    owner: OwnerToken,
    config: QueueConfig,
    store: Arc<dyn RecordStore>,
    enqueuer: Enqueuer,
    poller: Arc<ClaimPoller>,
    reaper: Arc<LeaseReaper>,
    poll_chain: TimerChain,
    reap_chain: TimerChain,
}

impl Listener {
    /// Build an idle listener over `store`.
    ///
    /// The returned receiver yields every claimed record and every error
    /// raised inside the chains. Dropping it makes the poller release what
    /// it claims.
    ///
    /// # Errors
    ///
    /// `Error::Config` if `config` fails validation.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: QueueConfig,
    ) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let owner = OwnerToken::generate();
        let (events, receiver) = event::channel();

        let poller = ClaimPoller::new(
            Arc::clone(&store),
            owner.clone(),
            config.topics.clone(),
            config.table.clone(),
            config.deadlock_count_limit,
            events.clone(),
        );
        let reaper = LeaseReaper::new(
            Arc::clone(&store),
            owner.clone(),
            config.table.clone(),
            config.heartbeat_lifetime(),
            config.deadlock_count_limit,
            events,
        );

        let listener = Self {
            enqueuer: Enqueuer::new(Arc::clone(&store), config.create_message_cycle_limit),
            poll_chain: TimerChain::new("poll", config.poll_delay()),
            reap_chain: TimerChain::new("reap", config.heartbeat_cleanup_delay()),
            poller: Arc::new(poller),
            reaper: Arc::new(reaper),
            owner,
            config,
            store,
        };
        Ok((listener, receiver))
    }

    /// Connect to Postgres by URL and build a listener on it.
    pub async fn connect(url: &str, config: QueueConfig) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let db = Db::connect(url, &config.table).await?;
        Self::new(Arc::new(db), config)
    }

    /// Connect using `config.connection`.
    pub async fn connect_with(config: QueueConfig) -> Result<(Self, EventReceiver)> {
        config.validate()?;
        let Some(ref connection) = config.connection else {
            return Err(Error::Config(
                "no connection parameters configured".to_string(),
            ));
        };
        let db = Db::connect_with(connection, &config.table).await?;
        Self::new(Arc::new(db), config)
    }

    /// This instance's owner token.
    pub fn owner(&self) -> &OwnerToken {
        &self.owner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Start the poll and reap chains. Chains already running are left
    /// alone, so calling this twice never creates a second chain.
    pub fn start_listening(&self) {
        let poller = Arc::clone(&self.poller);
        let polling = self.poll_chain.start(move |cancel: CancellationToken| {
            let poller = Arc::clone(&poller);
            async move {
                poller.tick(&cancel).await;
            }
        });

        let reaper = Arc::clone(&self.reaper);
        let restoring = self.reap_chain.start(move |cancel: CancellationToken| {
            let reaper = Arc::clone(&reaper);
            async move {
                reaper.tick(&cancel).await;
            }
        });

        if polling || restoring {
            info!(
                owner = %self.owner,
                table = %self.config.table,
                topics = ?self.config.topics.as_slice(),
                "listener started"
            );
        }
    }

    /// Stop both chains. Safe to call when not started, or twice.
    pub fn stop_listening(&self) {
        let polling = self.poll_chain.stop();
        let restoring = self.reap_chain.stop();
        if polling || restoring {
            info!(owner = %self.owner, "listener stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poll_chain.is_armed()
    }

    pub fn is_restoring(&self) -> bool {
        self.reap_chain.is_armed()
    }

    pub fn is_listening(&self) -> bool {
        self.is_polling() || self.is_restoring()
    }

    /// Run one claim attempt now, outside the poll chain. A claimed record
    /// is published on the event channel as usual.
    pub async fn check_now(&self) -> PollOutcome {
        self.poller.tick(&CancellationToken::new()).await
    }

    /// Run one reap sweep now, outside the reap chain.
    pub async fn reap_now(&self) -> ReapOutcome {
        self.reaper.tick(&CancellationToken::new()).await
    }

    /// Enqueue a message on this listener's store.
    pub async fn send(&self, message: &str, topic: Option<&str>) -> Result<SendOutcome> {
        self.enqueuer.send(message, topic).await
    }

    /// A producer handle sharing this listener's store.
    pub fn enqueuer(&self) -> Enqueuer {
        self.enqueuer.clone()
    }

    /// Stop both chains, then end the store session.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_listening();
        self.store.disconnect().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
