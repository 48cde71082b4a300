//! Pipelining, multiplexing PostgreSQL wire-protocol engine.
//!
//! `pgmux` drives the PostgreSQL v3 frontend/backend protocol for
//! workloads where many logical commands share few physical connections.
//! Writes serialize on a per-session write lock that is released once a
//! command's final `Sync` is flushed, so the next caller starts writing
//! while the first is still reading; responses resolve strictly FIFO
//! through a per-session operation queue.
//!
//! # Examples
//!
//! One session:
//!
//! ```no_run
//! use pgmux::{Command, Config, Session};
//!
//! # async fn app() -> pgmux::Result<()> {
//! let session = Session::connect(Config::from_env()).await?;
//!
//! let mut reader = session.submit(Command::new("SELECT 8")).await?;
//! while reader.read().await? {
//!     let row = reader.row().unwrap();
//!     let col = row.columns().next().unwrap()?.unwrap();
//!     assert_eq!(col.as_ref(), &8i32.to_be_bytes()[..]);
//! }
//! reader.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Multiplexed over a pool:
//!
//! ```no_run
//! use pgmux::{Command, Param, Pool, PoolConfig};
//!
//! # async fn app() -> pgmux::Result<()> {
//! let pool = Pool::connect_with(PoolConfig::from_env().max_sessions(10)).await?;
//!
//! let mut handles = vec![];
//! for i in 0..100 {
//!     let pool = pool.clone();
//!     handles.push(tokio::spawn(async move {
//!         let command = Command::new("INSERT INTO foo(id) VALUES($1)").bind(Param::int4(i));
//!         let mut reader = pool.submit(command).await?;
//!         reader.next_result().await?;
//!         let affected = reader.rows_affected();
//!         reader.close().await?;
//!         Ok::<_, pgmux::Error>(affected)
//!     }));
//! }
//! for handle in handles {
//!     handle.await.unwrap()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod net;

// Protocol
pub mod postgres;

// Encoding
pub mod encode;

// Component
mod stream;
mod statement;
mod queue;
mod handshake;

// Operation
pub mod command;
pub mod reader;

// Connection
mod config;
pub mod session;
pub mod pool;

mod error;

#[doc(inline)]
pub use command::{Command, ExecutionFlags};
#[doc(inline)]
pub use config::Config;
#[doc(inline)]
pub use encode::Param;
#[doc(inline)]
pub use config::ParseError;
#[doc(inline)]
pub use error::{ArgumentError, BrokenError, Error, ErrorKind, InvalidState, Result, UnsupportedAuth};
#[doc(inline)]
pub use pool::{Pool, PoolConfig, PoolSession};
#[doc(inline)]
pub use reader::CommandReader;
#[doc(inline)]
pub use session::{Session, SessionStatus};

pub use net::Io;
pub use statement::StatementName;
