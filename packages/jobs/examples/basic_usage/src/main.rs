#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Basic usage of the `switchy_jobs` job system.
//!
//! Builds a thread pool from the environment, then exercises the main
//! primitives: a contended mutex, a condition variable hand-off, a shared
//! future read by several jobs and a `wait_any` race.

use std::{sync::Arc, thread, time::Duration};

use switchy_jobs::{
    Builder, ConditionVariable, Error, Mutex, Spawner as _, UniqueLock, wait_any,
};

/// # Errors
///
/// * If the pool configuration in the environment is invalid
/// * If a worker thread fails to spawn
/// * If one of the jobs fails
fn main() -> Result<(), Error> {
    pretty_env_logger::init();

    let pool = Builder::from_env()?.build()?;
    println!("Started pool with {} workers", pool.worker_count());

    let counter = Arc::new(Mutex::new(0_u64));
    let incrementers = (0..4)
        .map(|_| {
            let counter = counter.clone();
            pool.enqueue_future(async move {
                for _ in 0..1_000 {
                    *counter.lock().await += 1;
                }
            })
        })
        .collect::<Vec<_>>();
    for incrementer in incrementers {
        incrementer.get()?;
    }
    println!("Counter: {}", *counter.lock_explicit());

    let mailbox = Arc::new((Mutex::new(None::<String>), ConditionVariable::new()));
    let receiver = {
        let mailbox = mailbox.clone();
        pool.enqueue_future(async move {
            let (slot, delivered) = &*mailbox;
            let mut lock = UniqueLock::from(slot.lock().await);
            while lock.is_none() {
                delivered.wait(&mut lock).await;
            }
            lock.take().unwrap_or_default()
        })
    };
    {
        let (slot, delivered) = &*mailbox;
        *slot.lock_explicit() = Some(String::from("hello from main"));
        delivered.notify_one();
    }
    println!("Received: {}", receiver.get()?);

    let config = pool
        .enqueue_future(|| {
            log::debug!("loading config");
            thread::sleep(Duration::from_millis(20));
            vec![("threads", 4), ("retries", 3)]
        })
        .share();
    let readers = (0..3)
        .map(|reader| {
            let config = config.clone();
            pool.enqueue_future(async move {
                let entries = (&config).await.map(Vec::len).unwrap_or_default();
                log::debug!("reader {reader} saw {entries} entries");
                entries
            })
        })
        .collect::<Vec<_>>();
    for reader in readers {
        println!("Reader saw {} entries", reader.get()?);
    }

    let racers = [300_u64, 50, 150].map(|millis| {
        pool.enqueue_future(move || {
            thread::sleep(Duration::from_millis(millis));
            millis
        })
    });
    let winner = race(&pool, racers)?;
    println!("Racer {winner} finished first");

    pool.shutdown();

    Ok(())
}

/// Runs the race inside a pool job and blocks until it reports a winner.
fn race<const N: usize>(
    pool: &switchy_jobs::ThreadpoolScheduler,
    racers: [switchy_jobs::Future<u64>; N],
) -> Result<usize, Error> {
    let winner = pool
        .enqueue_future(async move { wait_any(racers).await })
        .get()?;

    Ok(winner.unwrap_or_default())
}
