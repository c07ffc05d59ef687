//! Anomaly demonstrations over a small accounts keyspace.
//!
//! Balances are stored as big-endian `i64`.

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use isodb::{Engine, EngineError, IsolationLevel, Predicate, Transaction};
use std::sync::{Arc, Barrier};
use tokio::sync::mpsc;

const ALICE: &str = "alice";
const BOB: &str = "bob";
const OPENING_BALANCE: i64 = 1000;

fn encode(balance: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64(balance);
    buf.freeze()
}

fn decode(value: &Bytes) -> Option<i64> {
    if value.len() != 8 {
        return None;
    }
    Some(value.clone().get_i64())
}

fn balance(tx: &Transaction<'_>, account: &str) -> isodb::Result<Option<i64>> {
    Ok(tx.read(account)?.as_ref().and_then(decode))
}

fn show(balance: Option<i64>) -> String {
    match balance {
        Some(balance) => balance.to_string(),
        None => "<absent>".to_string(),
    }
}

fn accounts(tx: &Transaction<'_>) -> isodb::Result<Vec<String>> {
    Ok(tx.scan(Predicate::All)?.map(|(key, _)| key).collect())
}

/// Commits a reader, reporting retryable rejections instead of failing.
fn finish(reader: Transaction<'_>) -> Result<()> {
    match reader.commit() {
        Ok(ts) => println!("  reader committed at {}", ts),
        Err(err) if err.is_retryable() => println!("  reader commit rejected: {}", err),
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

pub fn seed(engine: &Engine) -> Result<()> {
    let tx = engine.transaction(IsolationLevel::ReadCommitted);
    tx.write(ALICE, encode(OPENING_BALANCE))?;
    tx.commit()?;
    Ok(())
}

/// Restores alice's opening balance and deletes every other account.
pub fn reset(engine: &Engine) -> Result<()> {
    let tx = engine.transaction(IsolationLevel::ReadCommitted);
    tx.write(ALICE, encode(OPENING_BALANCE))?;
    for key in accounts(&tx)? {
        if key != ALICE {
            tx.delete(&key)?;
        }
    }
    tx.commit()?;
    engine.garbage_collect();
    Ok(())
}

pub async fn run(engine: &Arc<Engine>, level: IsolationLevel) -> Result<()> {
    dirty_read(engine, level)?;
    non_repeatable_read(engine, level)?;
    phantom_read(engine, level)?;
    if level == IsolationLevel::Serializable {
        concurrent_withdrawals(engine).await?;
    }
    Ok(())
}

fn dirty_read(engine: &Engine, level: IsolationLevel) -> Result<()> {
    println!("-- dirty read");
    let writer = engine.transaction(IsolationLevel::ReadCommitted);
    writer.write(ALICE, encode(800))?;

    let reader = engine.transaction(level);
    println!(
        "  writer set alice to 800 (uncommitted); reader sees {}",
        show(balance(&reader, ALICE)?)
    );

    writer.rollback()?;
    println!(
        "  writer rolled back; reader sees {}",
        show(balance(&reader, ALICE)?)
    );
    finish(reader)
}

fn non_repeatable_read(engine: &Engine, level: IsolationLevel) -> Result<()> {
    println!("-- non-repeatable read");
    let reader = engine.transaction(level);
    let first = balance(&reader, ALICE)?;

    let writer = engine.transaction(IsolationLevel::ReadCommitted);
    writer.write(ALICE, encode(800))?;
    writer.commit()?;

    let second = balance(&reader, ALICE)?;
    println!(
        "  reader saw {} before and {} after a committed update ({})",
        show(first),
        show(second),
        if first == second { "stable" } else { "changed" }
    );
    finish(reader)
}

fn phantom_read(engine: &Engine, level: IsolationLevel) -> Result<()> {
    println!("-- phantom read");
    let reader = engine.transaction(level);
    let before = accounts(&reader)?;

    let writer = engine.transaction(IsolationLevel::ReadCommitted);
    writer.insert(BOB, encode(500))?;
    writer.commit()?;

    let after = accounts(&reader)?;
    println!(
        "  reader scanned {:?} before and {:?} after bob was inserted",
        before, after
    );
    finish(reader)
}

fn withdraw(engine: &Engine, amount: i64, both_read: &Barrier) -> isodb::Result<i64> {
    let tx = engine.transaction(IsolationLevel::Serializable);
    let current = balance(&tx, ALICE);
    both_read.wait();

    let updated = current?.unwrap_or(0) - amount;
    tx.write(ALICE, encode(updated))?;
    tx.commit()?;
    Ok(updated)
}

/// Two SERIALIZABLE withdrawals from the same snapshot; only one may commit.
async fn concurrent_withdrawals(engine: &Arc<Engine>) -> Result<()> {
    println!("-- concurrent withdrawals");
    let (sender, mut outcomes) = mpsc::channel::<(&'static str, isodb::Result<i64>)>(2);
    let both_read = Arc::new(Barrier::new(2));

    for (name, amount) in [("first", 100), ("second", 200)] {
        let engine = Arc::clone(engine);
        let both_read = Arc::clone(&both_read);
        let sender = sender.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = withdraw(&engine, amount, &both_read);
            // The receiver outlives both tasks.
            let _ = sender.blocking_send((name, outcome));
        });
    }
    drop(sender);

    let mut committed = 0;
    while let Some((name, outcome)) = outcomes.recv().await {
        match outcome {
            Ok(balance) => {
                committed += 1;
                println!("  {} withdrawal committed, alice now {}", name, balance);
            }
            Err(err @ EngineError::SerializationFailure { .. })
            | Err(err @ EngineError::LockConflict { .. })
            | Err(err @ EngineError::LockTimeout { .. }) => {
                println!("  {} withdrawal aborted: {}", name, err)
            }
            Err(err) => return Err(err.into()),
        }
    }
    println!("  {} of 2 withdrawals committed", committed);
    Ok(())
}
