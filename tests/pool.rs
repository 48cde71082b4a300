//! Dispatcher behavior: multiplexed submissions, exclusive checkout,
//! teardown.
mod common;

use std::{collections::HashSet, time::Duration};

use common::{Backend, TestServer};
use pgmux::{
    Command, ErrorKind, Pool, PoolConfig, SessionStatus,
    postgres::backend::TransactionStatus,
};

/// Echo backend shared by every pooled connection.
async fn echo_int_backend(mut backend: Backend<tokio::net::TcpStream>) {
    backend.startup().await;
    while let Some(messages) = backend.read_until_sync().await {
        let value: i32 = messages
            .iter()
            .find(|(t, _)| *t == b'P')
            .map(|(_, body)| {
                Backend::<tokio::net::TcpStream>::sql_of_parse(body)
                    .trim_start_matches("SELECT ")
                    .parse()
                    .unwrap()
            })
            .unwrap_or(-1);
        backend.int4_result(value, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    }
}

#[tokio::test]
async fn multiplexed_submissions_all_complete() {
    let server = TestServer::spawn(echo_int_backend).await;
    let config = PoolConfig::new(server.config()).max_sessions(2);
    let pool = Pool::connect_with(config).await.unwrap();

    // 10x the pool size, all in flight at once
    let mut handles = vec![];
    for i in 0..20 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let sql = format!("SELECT {i}");
            let mut reader = pool.submit(Command::new(sql)).await?;
            assert!(reader.read().await?);
            let row = reader.take_row().unwrap();
            let value = row.columns().next().unwrap().unwrap().unwrap();
            let value = i32::from_be_bytes(value.as_ref().try_into().unwrap());
            reader.close().await?;
            Ok::<_, pgmux::Error>(value)
        }));
    }

    let mut seen = HashSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let value = handle.await.unwrap().unwrap();
        assert_eq!(value, i as i32, "every caller got its own result");
        seen.insert(value);
    }
    assert_eq!(seen.len(), 20);

    pool.close().await;
}

#[tokio::test]
async fn exclusive_checkout_rejects_overlap_when_pipelining_disabled() {
    let server = TestServer::spawn(echo_int_backend).await;
    let config = PoolConfig::new(server.config())
        .max_sessions(1)
        .allow_pipelining(false);
    let pool = Pool::connect_with(config).await.unwrap();

    let mut session = pool.acquire().await.unwrap();

    let mut first = session.submit(Command::new("SELECT 1")).await.unwrap();

    // a second submit while the first is unfinished is refused
    let err = session.submit(Command::new("SELECT 2")).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));

    first.close().await.unwrap();

    let mut second = session.submit(Command::new("SELECT 3")).await.unwrap();
    assert!(second.read().await.unwrap());
    second.close().await.unwrap();
}

#[tokio::test]
async fn exclusive_checkout_allows_pipelining_when_enabled() {
    let server = TestServer::spawn(echo_int_backend).await;
    let config = PoolConfig::new(server.config()).max_sessions(1);
    let pool = Pool::connect_with(config).await.unwrap();

    let mut session = pool.acquire().await.unwrap();

    let mut first = session.submit(Command::new("SELECT 1")).await.unwrap();
    let mut second = session.submit(Command::new("SELECT 2")).await.unwrap();

    assert!(first.read().await.unwrap());
    first.close().await.unwrap();
    assert!(second.read().await.unwrap());
    second.close().await.unwrap();
}

#[tokio::test]
async fn released_session_serves_multiplexed_submissions() {
    let server = TestServer::spawn(echo_int_backend).await;
    let config = PoolConfig::new(server.config()).max_sessions(1);
    let pool = Pool::connect_with(config).await.unwrap();

    {
        let mut exclusive = pool.acquire().await.unwrap();
        let mut reader = exclusive.submit(Command::new("SELECT 1")).await.unwrap();
        reader.close().await.unwrap();
    } // checkout returns here

    let mut reader = pool.submit(Command::new("SELECT 2")).await.unwrap();
    assert!(reader.read().await.unwrap());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn abandoned_transaction_session_is_not_reused() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        while let Some(messages) = backend.read_until_sync().await {
            let sql = messages
                .iter()
                .find(|(t, _)| *t == b'P')
                .map(|(_, body)| Backend::<tokio::net::TcpStream>::sql_of_parse(body))
                .unwrap_or_default();
            if sql == "BEGIN" {
                backend.parse_complete();
                backend.bind_complete();
                backend.no_data();
                backend.command_complete("BEGIN");
                backend.ready_for_query(b'T');
            } else {
                // a command leaked onto the abandoned transaction would
                // observe `T` here instead
                backend.int4_result(5, true, true);
                backend.ready_for_query(b'I');
            }
            backend.flush().await;
        }
    })
    .await;

    let config = PoolConfig::new(server.config()).max_sessions(2);
    let pool = Pool::connect_with(config).await.unwrap();

    // open a transaction block on an exclusive checkout, then abandon it
    let mut exclusive = pool.acquire().await.unwrap();
    let mut reader = exclusive.submit(Command::new("BEGIN")).await.unwrap();
    assert!(!reader.read().await.unwrap());
    reader.close().await.unwrap();
    assert_eq!(exclusive.session().status(), SessionStatus::InTransaction);
    let abandoned = exclusive.session().clone();
    drop(exclusive);

    // the next connectionless submission must run outside any transaction
    let mut reader = pool.submit(Command::new("SELECT 5")).await.unwrap();
    assert!(reader.read().await.unwrap());
    reader.close().await.unwrap();
    assert_eq!(
        reader.transaction_status(),
        Some(TransactionStatus::Idle),
        "multiplexed command must not land inside the abandoned transaction",
    );

    // the dispatcher closed the mid-transaction session instead of
    // pooling it, which makes the server roll the transaction back
    tokio::time::timeout(Duration::from_secs(5), async {
        while abandoned.status() != SessionStatus::Broken {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("released mid-transaction session is closed, not pooled");
}

#[tokio::test]
async fn closed_pool_rejects_submissions() {
    let server = TestServer::spawn(echo_int_backend).await;
    let pool = Pool::connect_with(PoolConfig::new(server.config())).await.unwrap();

    pool.close().await;

    let err = pool.submit(Command::new("SELECT 1")).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));
}
