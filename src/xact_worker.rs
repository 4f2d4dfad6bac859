use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::transaction::Transaction;

/// Runs a batch of transactions on its own thread and keeps per-transaction
/// commit results.
pub struct TransactionWorker {
    transactions: Vec<Transaction>,
    stats: Arc<Mutex<Vec<bool>>>,
    handle: Option<JoinHandle<()>>,
}

impl TransactionWorker {
    pub fn new() -> Self {
        TransactionWorker {
            transactions: Vec::new(),
            stats: Arc::new(Mutex::new(Vec::new())),
            handle: None,
        }
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    /// Start executing the queued transactions in submission order.
    pub fn run(&mut self) {
        let mut transactions = std::mem::take(&mut self.transactions);
        let stats = Arc::clone(&self.stats);

        self.handle = Some(thread::spawn(move || {
            for transaction in transactions.iter_mut() {
                let committed = transaction.run();
                stats.lock().unwrap().push(committed);
            }
        }));
    }

    /// Wait for the worker to finish; returns the number of transactions that
    /// committed.
    pub fn join(&mut self) -> usize {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.stats.lock().unwrap().iter().filter(|&&c| c).count()
    }

    /// Per-transaction commit results, in execution order.
    pub fn stats(&self) -> Vec<bool> {
        self.stats.lock().unwrap().clone()
    }
}

impl Default for TransactionWorker {
    fn default() -> Self {
        TransactionWorker::new()
    }
}
