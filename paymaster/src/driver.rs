//{{ Paymaster }}
//Copyright (C) {{ 2021,2022,2023,2024 }}  {{ Blockstream }}

//This program is free software: you can redistribute it and/or modify
//it under the terms of the GNU Affero General Public License as published by
//the Free Software Foundation, either version 3 of the License, or
//(at your option) any later version.

//This program is distributed in the hope that it will be useful,
//but WITHOUT ANY WARRANTY; without even the implied warranty of
//MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//GNU Affero General Public License for more details.

//You should have received a copy of the GNU Affero General Public License
//along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! # Batch Driver
//!
//! Wraps the engine in one of two modes. Interactive: an operator picks
//! a subset of the pending payments, confirms, and watches the results.
//! Automated: a long-running loop that fires a batch whenever enough
//! blocks have elapsed, payments are pending, and the wallet holds
//! enough balance. All console I/O lives here; the engine never talks
//! to a terminal.
//!

use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use std::time::Duration;

use bitcoin::Amount;
use bitcoin::util::amount::Denomination;

use common::constants;
use common::{BatchMode, BlockHeight};
use config;
use engine::{self, Engine, PaymentResult, PaymentStatus};
use pool::{Obligation, PoolApi};
use rpc::ChainRpc;
use utils::Shutdown;

/// Cumulative session counters of a running driver, readable from
/// status tooling while the loop runs.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SessionStats {
    /// Batches dispatched since startup.
    pub batches: u64,
    /// Payments completed since startup.
    pub succeeded: u64,
    /// Partial payments since startup.
    pub partial: u64,
    /// Failed payments since startup.
    pub failed: u64,
    /// Total amount broadcast since startup.
    pub paid: Amount,
    /// The height the automated driver last dispatched at.
    pub last_processed_block: BlockHeight,
}

impl Default for SessionStats {
    fn default() -> SessionStats {
        SessionStats {
            batches: 0,
            succeeded: 0,
            partial: 0,
            failed: 0,
            paid: Amount::ZERO,
            last_processed_block: 0,
        }
    }
}

/// Why an automated iteration did not complete.
enum IterationError {
    /// A gateway call failed; back off and keep looping.
    Gateway(String),
    /// The engine hit a fatal condition; stop the process.
    Fatal(engine::Error),
}

/// The batch driver. Owns the gateways and the engine; constructed once
/// at startup after preflight.
pub struct Driver<C: ChainRpc, P: PoolApi> {
    /// Chain gateway.
    chain: C,
    /// Pool gateway.
    pool: P,
    /// The disburser engine.
    engine: Engine,
    /// Automated-mode settings.
    automation: config::Automation,
    /// Session counters.
    stats: Mutex<SessionStats>,
    /// Cancellation handle.
    shutdown: Shutdown,
}

impl<C: ChainRpc, P: PoolApi> Driver<C, P> {
    /// Create a driver around preflighted gateways.
    pub fn new(
        chain: C,
        pool: P,
        engine: Engine,
        automation: config::Automation,
        shutdown: Shutdown,
    ) -> Driver<C, P> {
        Driver {
            chain: chain,
            pool: pool,
            engine: engine,
            automation: automation,
            stats: Mutex::new(SessionStats::default()),
            shutdown: shutdown,
        }
    }

    /// Copy of the session counters.
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().unwrap()
    }

    /// Accessor for the engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn record_results(&self, results: &[PaymentResult], height: Option<BlockHeight>) {
        let mut stats = self.stats.lock().unwrap();
        stats.batches += 1;
        for result in results {
            match result.status {
                PaymentStatus::Succeeded => stats.succeeded += 1,
                PaymentStatus::PartiallyPaid => stats.partial += 1,
                PaymentStatus::Failed => stats.failed += 1,
                PaymentStatus::AlreadyCompleted => {}
            }
            stats.paid += result.completed;
        }
        if let Some(height) = height {
            stats.last_processed_block = height;
        }
        slog!(SessionStatus, batches: stats.batches, succeeded: stats.succeeded,
            partial: stats.partial, failed: stats.failed, paid_sat: stats.paid.to_sat(),
        );
    }

    // ** interactive mode **

    /// Run one operator-driven batch: list the pending payments, read a
    /// selection and a confirmation from stdin, run the engine, display
    /// the per-payment results.
    pub fn run_interactive(&mut self) -> Result<(), engine::Error> {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        self.interactive_session(&mut input, &mut output)
    }

    /// The interactive dialogue, with console handles injected so tests
    /// can drive it.
    fn interactive_session<R: BufRead, W: Write>(
        &mut self,
        input: &mut R,
        output: &mut W,
    ) -> Result<(), engine::Error> {
        let pool_id = self.engine.params().pool_id.clone();
        let pending = match self.pool.pending_payments(&pool_id) {
            Ok(pending) => pending,
            Err(e) => {
                let _ = writeln!(output, "cannot reach the pool: {}", e);
                return Ok(());
            }
        };
        if pending.is_empty() {
            let _ = writeln!(output, "no pending payments.");
            return Ok(());
        }

        let _ = writeln!(output, "{:>4}  {:>12}  {:>16}  {:<20}  {}",
            "#", "payment", "amount", "created", "address");
        for (idx, payment) in pending.iter().enumerate() {
            let _ = writeln!(output, "{:>4}  {:>12}  {:>16}  {:<20}  {}",
                idx + 1,
                payment.id,
                payment.amount.to_string_in(Denomination::Bitcoin),
                payment.created_at,
                payment.address,
            );
        }

        let _ = write!(output, "select payments to pay ('all', numbers like '1,3', or 'q'): ");
        let _ = output.flush();
        let mut line = String::new();
        if input.read_line(&mut line).is_err() {
            return Ok(());
        }
        let selection = match parse_selection(line.trim(), pending.len()) {
            Some(ref selection) if !selection.is_empty() => selection.clone(),
            _ => {
                let _ = writeln!(output, "nothing selected.");
                return Ok(());
            }
        };

        let batch: Vec<Obligation> = selection.iter().map(|&idx| pending[idx].clone()).collect();
        let total = batch.iter().fold(Amount::ZERO, |acc, p| acc + p.amount);
        let _ = write!(output, "pay {} payments totalling {}? (y/N): ",
            batch.len(), total.to_string_in(Denomination::Bitcoin));
        let _ = output.flush();
        let mut line = String::new();
        if input.read_line(&mut line).is_err() {
            return Ok(());
        }
        match line.trim() {
            "y" | "yes" => {}
            _ => {
                let _ = writeln!(output, "aborted.");
                return Ok(());
            }
        }

        let results = self.engine.run_batch(
            &self.chain, &self.pool, &batch, BatchMode::Interactive, &self.shutdown,
        )?;
        self.record_results(&results, None);

        for result in &results {
            let detail = match result.status {
                PaymentStatus::Failed => {
                    result.error.clone().unwrap_or_else(|| "unknown error".to_owned())
                }
                _ => result.txids.iter()
                    .map(|txid| txid.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            };
            let _ = writeln!(output, "{:>12}  {:<17}  {:>16}  {}",
                result.payment_id,
                status_label(result.status),
                result.completed.to_string_in(Denomination::Bitcoin),
                detail,
            );
        }
        Ok(())
    }

    // ** automated mode **

    /// Run the automated loop until shutdown is requested. Every poll
    /// interval the gates are checked (blocks elapsed since the last
    /// batch, payments pending, wallet balance above the floor) and a
    /// batch of at most `batch_size` payments is dispatched when they
    /// all pass. Iteration failures back off and continue; only a fatal
    /// engine error stops the loop.
    pub fn run_automated(&mut self) -> Result<(), engine::Error> {
        // Ride out a node that is still warming up instead of dying on a
        // startup race.
        let start_height = loop {
            match self.chain.block_count() {
                Ok(height) => break height,
                Err(e) => {
                    slog!(DriverErrored, error: format!("getblockcount: {}", e));
                    if !self.shutdown.sleep(Duration::from_secs(constants::DRIVER_ERROR_BACKOFF_SECS)) {
                        return Ok(());
                    }
                }
            }
        };
        // Backdate the last processed block so the first eligible
        // iteration fires immediately.
        self.stats.lock().unwrap().last_processed_block =
            start_height.saturating_sub(self.automation.block_period);
        slog!(AutomationStarted, batch_size: self.automation.batch_size,
            block_period: self.automation.block_period,
            poll_interval_secs: self.automation.poll_interval.as_secs(),
            start_height: start_height,
        );

        while !self.shutdown.is_requested() {
            match self.iteration() {
                Ok(()) => {
                    if !self.shutdown.sleep(self.automation.poll_interval) {
                        break;
                    }
                }
                Err(IterationError::Fatal(e)) => return Err(e),
                Err(IterationError::Gateway(error)) => {
                    slog!(DriverErrored, error: error);
                    if !self.shutdown.sleep(Duration::from_secs(constants::DRIVER_ERROR_BACKOFF_SECS)) {
                        break;
                    }
                }
            }
        }
        slog!(ShuttingDown, reason: "shutdown requested".to_owned());
        Ok(())
    }

    /// One iteration of the automated loop.
    fn iteration(&mut self) -> Result<(), IterationError> {
        let height = self.chain.block_count()
            .map_err(|e| IterationError::Gateway(format!("getblockcount: {}", e)))?;
        let balance = self.chain.balance()
            .map_err(|e| IterationError::Gateway(format!("getbalance: {}", e)))?;
        let pool_id = self.engine.params().pool_id.clone();
        let pending = self.pool.pending_payments(&pool_id)
            .map_err(|e| IterationError::Gateway(format!("pending payments: {}", e)))?;
        slog!(DriverIteration, height: height, pending: pending.len(),
            balance_sat: balance.to_sat(),
        );

        let last = self.stats.lock().unwrap().last_processed_block;
        if height.saturating_sub(last) < self.automation.block_period {
            slog!(BatchDeferred, reason: "block period not elapsed");
            return Ok(());
        }
        if pending.is_empty() {
            slog!(BatchDeferred, reason: "no pending payments");
            return Ok(());
        }
        if balance < self.automation.min_balance {
            slog!(BatchDeferred, reason: "balance below minimum");
            return Ok(());
        }

        let batch: Vec<Obligation> = pending.into_iter()
            .take(self.automation.batch_size)
            .collect();
        slog!(BatchTriggered, height: height, n_payments: batch.len());
        let results = self.engine.run_batch(
            &self.chain, &self.pool, &batch, BatchMode::Automated, &self.shutdown,
        ).map_err(IterationError::Fatal)?;
        self.record_results(&results, Some(height));
        Ok(())
    }
}

fn status_label(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Succeeded => "paid",
        PaymentStatus::AlreadyCompleted => "already paid",
        PaymentStatus::PartiallyPaid => "partially paid",
        PaymentStatus::Failed => "FAILED",
    }
}

/// Parse an operator selection: "all", or comma/space separated 1-based
/// indices. None means quit or an unusable line.
fn parse_selection(line: &str, n: usize) -> Option<Vec<usize>> {
    match line {
        "a" | "all" => Some((0..n).collect()),
        "q" | "quit" | "" => None,
        _ => {
            let mut selection = Vec::new();
            for token in line.split(|c| c == ',' || c == ' ').filter(|t| !t.is_empty()) {
                match token.parse::<usize>() {
                    Ok(idx) if idx >= 1 && idx <= n => {
                        if !selection.contains(&(idx - 1)) {
                            selection.push(idx - 1);
                        }
                    }
                    _ => return None,
                }
            }
            Some(selection)
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile;

    use engine::tests::{payment, test_engine, MockChain, MockPool};
    use fee::tests::utxo;
    use super::*;

    fn test_driver(
        dir: &tempfile::TempDir,
        chain: MockChain,
        pool: MockPool,
        automation: config::Automation,
    ) -> Driver<MockChain, MockPool> {
        Driver::new(chain, pool, test_engine(dir), automation, Shutdown::new())
    }

    fn automation(block_period: u64, batch_size: usize, min_balance_sat: u64) -> config::Automation {
        config::Automation {
            enabled: true,
            batch_size: batch_size,
            block_period: block_period,
            poll_interval: Duration::from_secs(1),
            min_balance: Amount::from_sat(min_balance_sat),
        }
    }

    #[test]
    fn selection_parsing() {
        assert_eq!(parse_selection("all", 3), Some(vec![0, 1, 2]));
        assert_eq!(parse_selection("a", 2), Some(vec![0, 1]));
        assert_eq!(parse_selection("1,3", 3), Some(vec![0, 2]));
        assert_eq!(parse_selection("3 1", 3), Some(vec![2, 0]));
        assert_eq!(parse_selection("1,1,2", 3), Some(vec![0, 1]));
        assert_eq!(parse_selection("q", 3), None);
        assert_eq!(parse_selection("", 3), None);
        assert_eq!(parse_selection("0", 3), None);
        assert_eq!(parse_selection("4", 3), None);
        assert_eq!(parse_selection("1,x", 3), None);
    }

    #[test]
    fn iteration_defers_until_block_period_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        chain.height = 100;
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminer", 1_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 0));
        driver.stats.lock().unwrap().last_processed_block = 95;

        driver.iteration().ok().unwrap();
        assert_eq!(driver.stats().batches, 0);
        assert!(driver.chain.broadcast.borrow().is_empty());
        // the marker does not move on a deferred iteration
        assert_eq!(driver.stats().last_processed_block, 95);
    }

    #[test]
    fn iteration_defers_without_pending_payments() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 0));
        driver.iteration().ok().unwrap();
        assert_eq!(driver.stats().batches, 0);
    }

    #[test]
    fn iteration_defers_below_minimum_balance() {
        let dir = tempfile::tempdir().unwrap();
        // 10 coins in the wallet, floor at 50
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminer", 1_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 50_0000_0000));
        driver.iteration().ok().unwrap();
        assert_eq!(driver.stats().batches, 0);
        assert!(driver.chain.broadcast.borrow().is_empty());
    }

    #[test]
    fn iteration_dispatches_and_advances_the_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        chain.height = 120;
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminer", 9_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 0));
        driver.stats.lock().unwrap().last_processed_block = 110;

        driver.iteration().ok().unwrap();
        let stats = driver.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.paid, Amount::from_sat(9_0000_0000));
        assert_eq!(stats.last_processed_block, 120);
        assert!(driver.engine().journal().is_completed(1));
        assert_eq!(driver.chain.broadcast.borrow().len(), 1);
    }

    #[test]
    fn iteration_truncates_to_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut chain = MockChain::new(vec![
            utxo(1, 10_0000_0000, 3),
            utxo(2, 10_0000_0000, 3),
        ]);
        chain.height = 120;
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminera", 1_0000_0000));
        pool.pending.borrow_mut().push(payment(2, "pl1qminerb", 1_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 1, 0));
        driver.stats.lock().unwrap().last_processed_block = 100;

        driver.iteration().ok().unwrap();
        // only the first pending payment went out
        assert!(driver.engine().journal().is_completed(1));
        assert!(!driver.engine().journal().is_completed(2));
    }

    #[test]
    fn interactive_selection_confirm_and_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminera", 1_0000_0000));
        pool.pending.borrow_mut().push(payment(2, "pl1qminerb", 1_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 0));
        let mut input: &[u8] = b"2\ny\n";
        let mut output = Vec::new();
        driver.interactive_session(&mut input, &mut output).unwrap();

        let console = String::from_utf8(output).unwrap();
        assert!(console.contains("pl1qminerb"));
        assert!(console.contains("pay 1 payments totalling 1?"));
        // only the selected payment was paid
        assert!(!driver.engine().journal().is_completed(1));
        assert!(driver.engine().journal().is_completed(2));
        assert_eq!(driver.stats().batches, 1);
    }

    #[test]
    fn interactive_abort_pays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let chain = MockChain::new(vec![utxo(1, 10_0000_0000, 3)]);
        let pool = MockPool::new();
        pool.pending.borrow_mut().push(payment(1, "pl1qminer", 1_0000_0000));

        let mut driver = test_driver(&dir, chain, pool, automation(10, 50, 0));
        let mut input: &[u8] = b"all\nn\n";
        let mut output = Vec::new();
        driver.interactive_session(&mut input, &mut output).unwrap();

        assert!(driver.chain.broadcast.borrow().is_empty());
        assert_eq!(driver.stats().batches, 0);
        let console = String::from_utf8(output).unwrap();
        assert!(console.contains("aborted."));
    }
}
