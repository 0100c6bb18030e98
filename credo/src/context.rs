use std::{fmt, sync::Arc};

use credo_clock::{Clock, System};

use crate::{
    coordinator::RefreshOptions,
    env::{Env, ProcessEnv},
    transport::Transport,
};

/// The collaborators a credential relies on
///
/// A context bundles the transport used to reach token endpoints, the clock
/// tokens are judged against, the environment consulted for configuration
/// variables, and the refresh options applied to new credentials.
#[derive(Clone)]
pub struct Context {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock + Send + Sync>,
    env: Arc<dyn Env>,
    options: RefreshOptions,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("transport", &self.transport)
            .field("now", &self.clock.now())
            .field("env", &self.env)
            .field("options", &self.options)
            .finish()
    }
}

impl Context {
    /// Constructs a context over `transport` using the system clock and the
    /// process environment
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            clock: Arc::new(System),
            env: Arc::new(ProcessEnv),
            options: RefreshOptions::default(),
        }
    }

    /// Replaces the clock
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replaces the environment lookup
    #[must_use]
    pub fn with_env(mut self, env: impl Env + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Replaces the refresh options given to new credentials
    #[must_use]
    pub fn with_refresh_options(mut self, options: RefreshOptions) -> Self {
        self.options = options;
        self
    }

    /// The transport used to reach token endpoints
    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// The clock tokens are judged against
    pub fn clock(&self) -> &(dyn Clock + Send + Sync) {
        &*self.clock
    }

    /// The environment lookup
    pub fn env(&self) -> &dyn Env {
        &*self.env
    }

    pub(crate) fn env_arc(&self) -> Arc<dyn Env> {
        Arc::clone(&self.env)
    }

    /// The refresh options given to new credentials
    pub fn refresh_options(&self) -> RefreshOptions {
        self.options
    }
}

#[cfg(feature = "reqwest")]
impl Default for Context {
    /// A context using [`ReqwestTransport`][crate::ReqwestTransport], the
    /// system clock, and the process environment
    fn default() -> Self {
        Self::new(Arc::new(crate::ReqwestTransport::default()))
    }
}
