// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{JobQueue, JobType};
use meridian_consensus::{
    ConsensusConfig, CoreContext, NetworkSink, PeerId, RoundManager, UniqueNodeList,
    ValidationCollection, ValidationStore, ValidatorSource,
};
use meridian_crypto::{NodeKeypair, NodePublicKey};
use meridian_infallible::Mutex;
use meridian_ledger::{AdmitAllEngine, LedgerMaster, TransactionEngine};
use meridian_shamap::FullBelowCache;
use meridian_store::HashedObjectStore;
use meridian_types::{NetworkClock, PeerMessage, SystemClock, Transaction};
use std::sync::Arc;

pub struct NodeConfig {
    pub consensus: ConsensusConfig,
    /// Validators trusted from configuration.
    pub trusted_validators: Vec<NodePublicKey>,
    /// Worker threads for background jobs.
    pub job_workers: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            trusted_validators: Vec::new(),
            job_workers: 4,
        }
    }
}

/// A fully wired node: storage, ledger pipeline, consensus, job queue. The
/// caller provides the network sink (and optionally a clock, engine, and
/// validator identity) and then cranks [`Node::tick`] on its timer cadence.
pub struct Node {
    ctx: Arc<CoreContext>,
    manager: Mutex<RoundManager>,
    jobs: JobQueue,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        network: Arc<dyn NetworkSink>,
        keys: Option<NodeKeypair>,
    ) -> Self {
        Self::with_parts(
            config,
            network,
            keys,
            Arc::new(SystemClock),
            Arc::new(AdmitAllEngine),
            None,
        )
    }

    pub fn with_parts(
        config: NodeConfig,
        network: Arc<dyn NetworkSink>,
        keys: Option<NodeKeypair>,
        clock: Arc<dyn NetworkClock>,
        engine: Arc<dyn TransactionEngine>,
        validation_store: Option<Arc<dyn ValidationStore>>,
    ) -> Self {
        let store = Arc::new(HashedObjectStore::in_memory());
        let master = Arc::new(LedgerMaster::new(
            store.clone(),
            config.consensus.min_validations,
        ));
        let unl = Arc::new(UniqueNodeList::new(32));
        for key in &config.trusted_validators {
            unl.add_validator(*key, ValidatorSource::Config);
        }
        unl.rescore();
        let validations = Arc::new(ValidationCollection::new(
            clock.clone(),
            unl.clone(),
            master.clone(),
            validation_store,
            &config.consensus,
        ));
        let ctx = Arc::new(CoreContext {
            store,
            ledger_master: master,
            validations,
            unl,
            full_below: Arc::new(FullBelowCache::default()),
            network,
            clock,
            engine,
            keys,
            config: config.consensus,
        });
        Self {
            manager: Mutex::new(RoundManager::new(ctx.clone())),
            jobs: JobQueue::new(config.job_workers),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Turn of the crank; call on a fixed cadence (hundreds of ms).
    pub fn tick(&self, now_ms: u64) -> anyhow::Result<()> {
        self.manager.lock().tick(now_ms)?;
        // Stale validations drain off the consensus path.
        if self.ctx.validations.stale_backlog() >= 64 {
            let validations = self.ctx.validations.clone();
            self.jobs.add_job(JobType::ValidationWrite, "validation-write", move || {
                validations.write_stale();
            });
        }
        Ok(())
    }

    pub fn handle_message(&self, from: PeerId, msg: PeerMessage, now_ms: u64) {
        self.manager.lock().handle_message(from, msg, now_ms);
    }

    /// Submits a client transaction targeted at the current open ledger.
    pub fn submit_transaction(&self, tx: Transaction) {
        let master = self.ctx.ledger_master.clone();
        self.jobs.add_job(JobType::Transaction, "submit-transaction", move || {
            let seq = master.open_seq();
            let _ = master.submit(Arc::new(tx), seq);
        });
    }

    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }
}
