//! Pipelining: overlapping writes and reads on one session, FIFO
//! completion, batch error barriers.
mod common;

use std::time::Duration;

use common::{Backend, TestServer, kinds};
use pgmux::{Command, Session, SessionStatus};

/// The backend answers each extended command with the int value extracted
/// from its SQL text (`SELECT <n>`), in arrival order.
async fn echo_int_backend(mut backend: Backend<tokio::net::TcpStream>) {
    backend.startup().await;
    while let Some(messages) = backend.read_until_sync().await {
        let parse = messages.iter().find(|(t, _)| *t == b'P');
        let value: i32 = match parse {
            Some((_, body)) => Backend::<tokio::net::TcpStream>::sql_of_parse(body)
                .trim_start_matches("SELECT ")
                .parse()
                .unwrap(),
            None => -1,
        };
        backend.int4_result(value, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    }
}

fn int4_of(reader: &mut pgmux::CommandReader) -> i32 {
    let row = reader.take_row().unwrap();
    let value = row.columns().next().unwrap().unwrap().unwrap();
    i32::from_be_bytes(value.as_ref().try_into().unwrap())
}

#[tokio::test]
async fn pipelined_commands_complete_in_fifo_order() {
    let server = TestServer::spawn(echo_int_backend).await;
    let session = Session::connect(server.config()).await.unwrap();

    // three commands written back to back, none read yet
    let mut readers = vec![];
    for i in 1..=3 {
        let sql = format!("SELECT {i}");
        readers.push(session.submit(Command::new(sql)).await.unwrap());
    }

    // the head slot's read turn is pre-signaled; the tail's is not
    assert!(readers[0].is_read_turn());

    // responses resolve strictly in submit order
    for (i, reader) in readers.iter_mut().enumerate() {
        assert!(reader.read().await.unwrap());
        assert!(reader.is_read_turn(), "a readable command owns the read turn");
        assert_eq!(int4_of(reader), i as i32 + 1);
        reader.close().await.unwrap();
    }
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn later_command_readable_before_earlier_one_is_consumed() {
    let server = TestServer::spawn(echo_int_backend).await;
    let session = Session::connect(server.config()).await.unwrap();

    let mut first = session.submit(Command::new("SELECT 1")).await.unwrap();
    let mut second = session.submit(Command::new("SELECT 2")).await.unwrap();

    // the engine buffers the first command's responses while the second
    // is being read; neither blocks the other
    assert!(second.read().await.unwrap());
    assert_eq!(int4_of(&mut second), 2);
    second.close().await.unwrap();

    assert!(first.read().await.unwrap());
    assert_eq!(int4_of(&mut first), 1);
    first.close().await.unwrap();
}

#[tokio::test]
async fn batch_error_barrier() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let messages = backend.read_until_sync().await.unwrap();
        // three statements, one trailing Sync
        assert_eq!(kinds(&messages), "PBDEPBDEPBDES");

        // first succeeds
        backend.int4_result(1, true, true);
        // second fails at execution
        backend.parse_complete();
        backend.bind_complete();
        backend.row_description(&[("?column?", 23)]);
        backend.error_response("22012", "division by zero");
        // third is skipped up to the Sync
        backend.ready_for_query(b'I');
        backend.flush().await;

        // the barrier held: the session accepts the next command
        if backend.read_until_sync().await.is_some() {
            backend.int4_result(9, true, true);
            backend.ready_for_query(b'I');
            backend.flush().await;
        }
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let command = Command::new("SELECT 1")
        .batch("SELECT 1/0")
        .batch("SELECT 2");
    let mut reader = session.submit(command).await.unwrap();

    // statement 1 completes normally
    assert!(reader.read().await.unwrap());
    assert_eq!(int4_of(&mut reader), 1);
    assert!(!reader.read().await.unwrap());

    // statement 2 surfaces the server error
    let err = reader.next_result().await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().sqlstate(), "22012");

    // statement 3 completes with the same error
    let err = reader.next_result().await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().sqlstate(), "22012");

    // then the batch is exhausted and the session recovered
    assert!(!reader.next_result().await.unwrap());
    reader.close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);

    let mut reader = session.submit(Command::new("SELECT 9")).await.unwrap();
    assert!(reader.read().await.unwrap());
    assert_eq!(int4_of(&mut reader), 9);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn write_path_not_blocked_by_unread_responses() {
    // the backend delays the first command's response until it has seen
    // the second command's bytes, which only works if the write lock is
    // released after Sync rather than after the response
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let first = backend.read_until_sync().await.unwrap();
        let second = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&first), "PBDES");
        assert_eq!(kinds(&second), "PBDES");

        backend.int4_result(1, true, true);
        backend.ready_for_query(b'I');
        backend.int4_result(2, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();

    let mut first = session.submit(Command::new("SELECT 1")).await.unwrap();
    let mut second = tokio::time::timeout(
        Duration::from_secs(5),
        session.submit(Command::new("SELECT 2")),
    )
    .await
    .expect("second write must not wait for the first response")
    .unwrap();

    assert!(first.read().await.unwrap());
    assert_eq!(int4_of(&mut first), 1);
    first.close().await.unwrap();

    assert!(second.read().await.unwrap());
    assert_eq!(int4_of(&mut second), 2);
    second.close().await.unwrap();
}

#[tokio::test]
async fn dropped_reader_does_not_wedge_the_session() {
    let server = TestServer::spawn(echo_int_backend).await;
    let session = Session::connect(server.config()).await.unwrap();

    // submit and drop without reading anything
    let reader = session.submit(Command::new("SELECT 1")).await.unwrap();
    drop(reader);

    // the read loop drains the abandoned command on its own
    let mut reader = session.submit(Command::new("SELECT 2")).await.unwrap();
    assert!(reader.read().await.unwrap());
    assert_eq!(int4_of(&mut reader), 2);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn single_row_mode_stops_after_one_row() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let messages = backend.read_until_sync().await.unwrap();
        let execute = messages.iter().find(|(t, _)| *t == b'E').unwrap();
        let max_rows = i32::from_be_bytes(execute.1[execute.1.len() - 4..].try_into().unwrap());
        assert_eq!(max_rows, 1, "single row mode limits Execute");

        backend.parse_complete();
        backend.bind_complete();
        backend.row_description(&[("?column?", 23)]);
        backend.int4_row(1);
        backend.portal_suspended();
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let command = Command::new("SELECT generate_series(1,1000000)")
        .flags(pgmux::ExecutionFlags::SINGLE_ROW);
    let mut reader = session.submit(command).await.unwrap();

    assert!(reader.read().await.unwrap());
    assert_eq!(int4_of(&mut reader), 1);
    assert!(!reader.read().await.unwrap(), "portal suspended ends the result");
    reader.close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);
}
