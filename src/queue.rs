//! Wallet mutation queue
//!
//! The wallet lives on one dedicated thread. Host calls and the sync driver
//! submit closures; they run one at a time in submission order, so a read
//! queued after a write always sees it. A panicking job is contained and
//! reported to its caller as an error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::error::{Result, WalletError};
use crate::wallet::Wallet;

type Job = Box<dyn FnOnce(&mut Wallet) + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// Cloneable submitter.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<Message>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("QueueHandle") }
}

fn stopped() -> WalletError { WalletError::invalid_state("wallet queue", "stopped") }

impl QueueHandle {
    /// Run `job` and block the calling thread for its result. Must not be
    /// called from inside an async task.
    pub fn call<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Wallet) -> R + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.submit(Box::new(move |w| {
            let _ = tx.send(job(w));
        }))?;
        rx.recv().map_err(|_| WalletError::Unknown("wallet job panicked".into()))
    }

    pub async fn call_async<R, F>(&self, job: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Wallet) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(Box::new(move |w| {
            let _ = tx.send(job(w));
        }))?;
        rx.await.map_err(|_| WalletError::Unknown("wallet job panicked".into()))
    }

    fn submit(&self, job: Job) -> Result<()> { self.tx.send(Message::Run(job)).map_err(|_| stopped()) }
}

#[derive(Debug)]
pub struct WalletQueue {
    handle: QueueHandle,
    thread: Option<JoinHandle<Wallet>>,
}

impl WalletQueue {
    pub fn spawn(wallet: Wallet) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let thread = std::thread::Builder::new()
            .name("wallet-mutations".into())
            .spawn(move || worker(wallet, rx))
            .map_err(|e| WalletError::Unknown(format!("spawn wallet thread: {e}")))?;
        Ok(Self { handle: QueueHandle { tx }, thread: Some(thread) })
    }

    pub fn handle(&self) -> QueueHandle { self.handle.clone() }

    /// Finish queued jobs, flush, and hand the wallet back.
    pub fn shutdown(mut self) -> Result<Wallet> { self.stop() }

    fn stop(&mut self) -> Result<Wallet> {
        let thread = self.thread.take().ok_or_else(stopped)?;
        let _ = self.handle.tx.send(Message::Stop);
        thread.join().map_err(|_| WalletError::Unknown("wallet thread panicked".into()))
    }
}

impl Drop for WalletQueue {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

fn worker(mut wallet: Wallet, rx: mpsc::Receiver<Message>) -> Wallet {
    while let Ok(Message::Run(job)) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(|| job(&mut wallet))).is_err() {
            tracing::error!("Wallet job panicked");
        }
    }
    if let Err(e) = wallet.flush_if_dirty() {
        tracing::error!(error = %e, "Final wallet flush failed");
    }
    wallet
}
