use crate::config::Config;

const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_MAX_QUEUE_DEPTH: usize = 32;

/// Data source configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub(crate) conn: Config,
    pub(crate) max_sessions: usize,
    pub(crate) max_queue_depth: usize,
    pub(crate) allow_pipelining: bool,
}

impl PoolConfig {
    pub fn new(conn: Config) -> PoolConfig {
        PoolConfig {
            conn,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            allow_pipelining: true,
        }
    }

    /// See [`Config::from_env`].
    pub fn from_env() -> PoolConfig {
        PoolConfig::new(Config::from_env())
    }

    /// Maximum number of concurrently open sessions.
    pub fn max_sessions(mut self, max: usize) -> PoolConfig {
        self.max_sessions = max.max(1);
        self
    }

    /// Commands a single session may have in flight before the dispatcher
    /// stops leasing it.
    pub fn max_queue_depth(mut self, depth: usize) -> PoolConfig {
        self.max_queue_depth = depth.max(1);
        self
    }

    /// Whether an exclusively checked out session accepts a submit while a
    /// previous command on it is unfinished.
    pub fn allow_pipelining(mut self, allow: bool) -> PoolConfig {
        self.allow_pipelining = allow;
        self
    }
}
