//! Events - state changes published to the host, and background faults
//!
//! Hosts subscribe to a broadcast channel instead of polling properties.
//! Faults raised on background tasks (peer traffic, block application) go to
//! an injected [`FaultHandler`]; with none installed the process aborts
//! rather than carry on with a wallet in an unknown state.

use std::sync::Arc;

use bitcoin::Txid;
use tokio::sync::broadcast;

use crate::error::WalletError;
use crate::ledger::Balance;
use crate::manager::Lifecycle;
use crate::sync::SyncState;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    EngineStarted,
    EngineStopped,
    TransactionChanged { txid: Txid },
    CoinsReceived { txid: Txid, amount: u64 },
    TransactionBroadcast { txid: Txid },
    TransactionFailed { txid: Txid, reason: String },
    BalanceChanged(Balance),
    SyncProgress(SyncState),
    PeerCountChanged(usize),
    StateChanged(Lifecycle),
    /// Keys or encryption changed.
    WalletChanged,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletEvent>,
}

impl Default for EventBus {
    fn default() -> Self { Self::new() }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Slow subscribers lose the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> { self.sender.subscribe() }

    pub fn publish(&self, event: WalletEvent) {
        tracing::trace!(?event, "Event");
        let _ = self.sender.send(event);
    }
}

/// A failure not tied to any host call.
#[derive(Debug, Clone)]
pub struct Fault {
    pub context: &'static str,
    pub error: WalletError,
}

pub trait FaultHandler: Send + Sync {
    fn handle(&self, fault: &Fault);
}

impl<F> FaultHandler for F
where
    F: Fn(&Fault) + Send + Sync,
{
    fn handle(&self, fault: &Fault) { self(fault) }
}

#[derive(Clone, Default)]
pub struct FaultReporter {
    handler: Option<Arc<dyn FaultHandler>>,
}

impl std::fmt::Debug for FaultReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultReporter").field("installed", &self.handler.is_some()).finish()
    }
}

impl FaultReporter {
    pub fn new(handler: Option<Arc<dyn FaultHandler>>) -> Self { Self { handler } }

    pub fn is_installed(&self) -> bool { self.handler.is_some() }

    pub fn report(&self, context: &'static str, error: WalletError) {
        tracing::error!(context, error = %error, "Background fault");
        let fault = Fault { context, error };
        match &self.handler {
            Some(handler) => handler.handle(&fault),
            None => {
                tracing::error!("No fault handler installed, aborting");
                std::process::abort();
            }
        }
    }
}
