//! Single-session end to end scenarios against the scripted backend.
mod common;

use common::{Backend, TestServer, kinds};
use pgmux::{Command, ErrorKind, ExecutionFlags, Param, Session, SessionStatus};

#[tokio::test]
async fn select_one_row() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let messages = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&messages), "PBDES");

        backend.int4_result(8, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);
    assert_eq!(session.backend_pid(), Some(4242));
    assert_eq!(session.parameter("server_version").as_deref(), Some("17.0"));

    let mut reader = session.submit(Command::new("SELECT 8")).await.unwrap();
    assert!(reader.read().await.unwrap());
    assert_eq!(reader.field_count(), 1);
    assert!(reader.has_rows());

    let row = reader.take_row().unwrap();
    let value = row.columns().next().unwrap().unwrap().unwrap();
    assert_eq!(value.as_ref(), &8i32.to_be_bytes()[..]);

    assert!(!reader.read().await.unwrap());
    assert_eq!(reader.rows_affected(), -1);

    reader.close().await.unwrap();
    assert!(reader.is_closed());
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn multiple_rows() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        backend.read_until_sync().await.unwrap();

        backend.parse_complete();
        backend.bind_complete();
        backend.row_description(&[("generate_series", 23)]);
        for value in 1..=3 {
            backend.int4_row(value);
        }
        backend.command_complete("SELECT 3");
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::new("SELECT generate_series(1,3)")).await.unwrap();

    let mut values = vec![];
    while reader.read().await.unwrap() {
        let row = reader.take_row().unwrap();
        let value = row.columns().next().unwrap().unwrap().unwrap();
        values.push(i32::from_be_bytes(value.as_ref().try_into().unwrap()));
    }
    assert_eq!(values, [1, 2, 3]);
    assert_eq!(reader.rows_affected(), -1, "SELECT reports no modification count");

    reader.close().await.unwrap();
}

#[tokio::test]
async fn simple_query_multiple_results() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let (msgtype, body) = backend.read_frontend().await.unwrap();
        assert_eq!(msgtype, b'Q');
        assert_eq!(Backend::<tokio::net::TcpStream>::sql_of_query(&body), "SELECT 1; SELECT 'x'");

        backend.row_description(&[("?column?", 23)]);
        backend.int4_row(1);
        backend.command_complete("SELECT 1");
        backend.row_description(&[("?column?", 25)]);
        backend.data_row(&[Some(b"x")]);
        backend.command_complete("SELECT 1");
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::simple("SELECT 1; SELECT 'x'")).await.unwrap();

    assert!(reader.read().await.unwrap());
    let row = reader.take_row().unwrap();
    assert_eq!(row.columns().next().unwrap().unwrap().unwrap().as_ref(), &1i32.to_be_bytes()[..]);
    assert!(!reader.read().await.unwrap());

    assert!(reader.next_result().await.unwrap());
    assert!(reader.read().await.unwrap());
    let row = reader.take_row().unwrap();
    assert_eq!(row.columns().next().unwrap().unwrap().unwrap().as_ref(), b"x");
    assert!(!reader.read().await.unwrap());

    assert!(!reader.next_result().await.unwrap());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn server_error_leaves_session_usable() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        backend.read_until_sync().await.unwrap();
        backend.parse_complete();
        backend.bind_complete();
        backend.row_description(&[("?column?", 23)]);
        backend.error_response("22012", "division by zero");
        backend.ready_for_query(b'I');
        backend.flush().await;

        // the session stays usable for the next command
        backend.read_until_sync().await.unwrap();
        backend.int4_result(7, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();

    let mut reader = session.submit(Command::new("SELECT 1/0")).await.unwrap();
    let err = reader.read().await.unwrap_err();
    assert_eq!(err.as_db_error().unwrap().sqlstate(), "22012");
    reader.close().await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);

    let mut reader = session.submit(Command::new("SELECT 7")).await.unwrap();
    assert!(reader.read().await.unwrap());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn prepared_statement_skips_parse_and_describe() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let first = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&first), "PBDES");
        backend.int4_result(42, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;

        let second = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&second), "BES", "cache hit skips Parse and Describe");
        backend.bind_complete();
        backend.int4_row(42);
        backend.command_complete("SELECT 1");
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();

    for _ in 0..2 {
        let command = Command::new("SELECT $1::int").bind(Param::int4(42));
        let mut reader = session.submit(command).await.unwrap();
        assert!(reader.read().await.unwrap());
        assert_eq!(reader.field_count(), 1, "layout known even without Describe");
        let row = reader.take_row().unwrap();
        assert_eq!(row.columns().next().unwrap().unwrap().unwrap().as_ref(), &42i32.to_be_bytes()[..]);
        reader.close().await.unwrap();
    }
}

#[tokio::test]
async fn schema_only_describes_without_executing() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let messages = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&messages), "PDS", "Parse, Describe statement, Sync");
        assert_eq!(messages[1].1[0], b'S', "statement variant of Describe");

        backend.parse_complete();
        backend.parameter_description(&[23]);
        backend.row_description(&[("value", 23)]);
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let command = Command::new("SELECT $1::int")
        .bind(Param::int4(1))
        .flags(ExecutionFlags::SCHEMA_ONLY);
    let mut reader = session.submit(command).await.unwrap();

    assert!(!reader.read().await.unwrap(), "schema only yields no rows");
    assert_eq!(reader.field_count(), 1);
    assert_eq!(reader.parameter_oids(), Some(&[23u32][..]));
    assert!(!reader.has_rows());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn row_stream_adapter() {
    use futures_util::TryStreamExt;

    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        backend.read_until_sync().await.unwrap();

        backend.parse_complete();
        backend.bind_complete();
        backend.row_description(&[("n", 23)]);
        for value in [10, 20, 30] {
            backend.int4_row(value);
        }
        backend.command_complete("SELECT 3");
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::new("SELECT n FROM t")).await.unwrap();

    let rows: Vec<_> = reader.rows().try_collect().await.unwrap();
    let values: Vec<i32> = rows
        .iter()
        .map(|row| {
            let value = row.columns().next().unwrap().unwrap().unwrap();
            i32::from_be_bytes(value.as_ref().try_into().unwrap())
        })
        .collect();
    assert_eq!(values, [10, 20, 30]);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn statement_cache_eviction_closes_server_statement() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;

        let messages = backend.read_until_sync().await.unwrap();
        assert_eq!(kinds(&messages), "PBDES");
        backend.int4_result(1, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;

        // each further statement evicts the previous one from the
        // one-entry cache; the Close rides in front of the new command
        for value in [2, 3] {
            let messages = backend.read_until_sync().await.unwrap();
            assert_eq!(kinds(&messages), "CPBDES");
            assert_eq!(messages[0].1[0], b'S', "statement variant of Close");
            backend.close_complete();
            backend.int4_result(value, true, true);
            backend.ready_for_query(b'I');
            backend.flush().await;
        }
    })
    .await;

    let config = server
        .config()
        .statement_cache_capacity(std::num::NonZeroUsize::new(1).unwrap());
    let session = Session::connect(config).await.unwrap();

    for (sql, expected) in [("SELECT 1", 1), ("SELECT 2", 2), ("SELECT 3", 3)] {
        let mut reader = session.submit(Command::new(sql)).await.unwrap();
        assert!(reader.read().await.unwrap());
        let row = reader.take_row().unwrap();
        let value = row.columns().next().unwrap().unwrap().unwrap();
        assert_eq!(i32::from_be_bytes(value.as_ref().try_into().unwrap()), expected);
        reader.close().await.unwrap();
    }
}

#[tokio::test]
async fn empty_query() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        backend.read_frontend().await.unwrap();
        backend.empty_query_response();
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::simple("")).await.unwrap();
    assert!(!reader.read().await.unwrap());
    assert!(!reader.has_rows());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn async_responses_intercepted() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        backend.read_until_sync().await.unwrap();

        backend.parse_complete();
        // async responses interleave anywhere between protocol messages
        backend.notification(99, "events", "hello");
        backend.parameter_status("application_name", "muxed");
        backend.bind_complete();
        backend.row_description(&[("?column?", 23)]);
        backend.int4_row(5);
        backend.command_complete("SELECT 1");
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::new("SELECT 5")).await.unwrap();
    assert!(reader.read().await.unwrap(), "async responses do not disturb rows");
    assert!(!reader.read().await.unwrap());
    reader.close().await.unwrap();

    let notifications = session.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(&*notifications[0].channel, "events");
    assert_eq!(&*notifications[0].payload, "hello");
    assert_eq!(session.parameter("application_name").as_deref(), Some("muxed"));
}

#[tokio::test]
async fn cleartext_password_authentication() {
    let server = TestServer::spawn(|mut backend| async move {
        match backend.read_initial().await {
            Some(common::Initial::Startup(_)) => {},
            _ => panic!("expected startup"),
        }
        backend.auth_cleartext();
        backend.flush().await;

        let (msgtype, body) = backend.read_frontend().await.unwrap();
        assert_eq!(msgtype, b'p');
        assert_eq!(&body[..], b"sesame\0");

        backend.auth_ok();
        backend.backend_key_data(1, 2);
        backend.ready_for_query(b'I');
        backend.flush().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Ready);
}

#[tokio::test]
async fn sasl_authentication_unsupported() {
    let server = TestServer::spawn(|mut backend| async move {
        match backend.read_initial().await {
            Some(common::Initial::Startup(_)) => {},
            _ => panic!("expected startup"),
        }
        backend.auth_sasl();
        backend.flush().await;
    })
    .await;

    let err = Session::connect(server.config()).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::UnsupportedAuth(_)));
}

#[tokio::test]
async fn disconnect_breaks_session_and_pending_commands() {
    let server = TestServer::spawn(|mut backend| async move {
        backend.startup().await;
        backend.read_until_sync().await.unwrap();
        backend.parse_complete();
        backend.bind_complete();
        backend.flush().await;
        backend.shutdown().await;
    })
    .await;

    let session = Session::connect(server.config()).await.unwrap();
    let mut reader = session.submit(Command::new("SELECT pg_sleep(10)")).await.unwrap();

    let err = reader.read().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Broken(_)));
    assert_eq!(session.status(), SessionStatus::Broken);

    // a broken session rejects further submissions
    let err = session.submit(Command::new("SELECT 1")).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Broken(_)));
}

#[tokio::test]
async fn session_over_inprocess_duplex() {
    let (client, server) = tokio::io::duplex(4096);

    tokio::spawn(async move {
        let mut backend = Backend::over_duplex(server);
        backend.startup().await;
        backend.read_until_sync().await.unwrap();
        backend.int4_result(8, true, true);
        backend.ready_for_query(b'I');
        backend.flush().await;
    });

    let config = pgmux::Config::parse("postgres://u:p@unreachable:5432/db").unwrap();
    let session = Session::connect_io(client, config).await.unwrap();
    let mut reader = session.submit(Command::new("SELECT 8")).await.unwrap();
    assert!(reader.read().await.unwrap());
    reader.close().await.unwrap();
}
