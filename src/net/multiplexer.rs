use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::select_all;
use tokio::runtime::{Builder, Runtime};

use super::connection::{Connection, Progress};
use super::request::{Request, RequestId, RequestState};
use super::response::ResponseHead;
use crate::error::NetError;

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hard ceiling on simultaneously open sockets.
    pub concurrency: usize,
    pub max_redirects: u32,
    /// Longest wait for any socket activity before every open request fails.
    pub poll_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            user_agent: concat!("bytechain/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[derive(Debug)]
pub enum Event {
    /// A successful response head, sent once before its body.
    Headers { request: Request, head: ResponseHead },
    BodyChunk { request: Request, data: Bytes },
    Failed { request: Request, error: NetError },
    Finished { request: Request },
}

impl Event {
    pub fn request(&self) -> &Request {
        match self {
            Event::Headers { request, .. }
            | Event::BodyChunk { request, .. }
            | Event::Failed { request, .. }
            | Event::Finished { request } => request,
        }
    }
}

/// A request waiting for a connection slot.
struct Admission {
    request: Request,
    url: String,
    hops: u32,
}

/// Fetches many URLs at once over non-blocking sockets, on the calling
/// thread.
///
/// Nothing happens in the background: all socket work is done inside
/// [`poll_next_event`](RequestMultiplexer::poll_next_event), which drives a
/// private single-threaded runtime until one event is ready.
pub struct RequestMultiplexer {
    runtime: Runtime,
    core: Core,
}

struct Core {
    config: ClientConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
    queue: VecDeque<Admission>,
    /// Open connections in service order.
    active: VecDeque<Connection>,
    states: HashMap<RequestId, RequestState>,
    events: VecDeque<Event>,
    peak_active: usize,
}

impl RequestMultiplexer {
    pub fn new(config: ClientConfig) -> Result<Self, NetError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            runtime,
            core: Core {
                config,
                tls: None,
                queue: VecDeque::new(),
                active: VecDeque::new(),
                states: HashMap::new(),
                events: VecDeque::new(),
                peak_active: 0,
            },
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.core.config
    }

    /// Records requests as enqueued. No socket is opened until the next poll.
    pub fn enqueue(&mut self, requests: impl IntoIterator<Item = Request>) {
        for request in requests {
            tracing::debug!(request = %request.id, url = %request.url, "enqueued");
            self.core.states.insert(request.id, RequestState::Enqueued);
            self.core.queue.push_back(Admission {
                url: request.url.clone(),
                request,
                hops: 0,
            });
        }
    }

    /// Waits for the next event. `None` means nothing is active or queued.
    pub fn poll_next_event(&mut self) -> Option<Event> {
        let Self { runtime, core } = self;
        runtime.block_on(core.next_event())
    }

    /// `None` for unknown requests and for requests whose final event was
    /// already handed out.
    pub fn state(&self, id: RequestId) -> Option<RequestState> {
        self.core.states.get(&id).copied()
    }

    pub fn active_count(&self) -> usize {
        self.core.active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.core.queue.len()
    }

    /// Most connections ever open at once.
    pub fn peak_active(&self) -> usize {
        self.core.peak_active
    }

    pub fn is_idle(&self) -> bool {
        self.core.active.is_empty() && self.core.queue.is_empty() && self.core.events.is_empty()
    }
}

impl Core {
    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.events.pop_front() {
                if let Event::Finished { request } | Event::Failed { request, .. } = &event {
                    self.states.remove(&request.id);
                }
                return Some(event);
            }
            self.admit();
            if !self.events.is_empty() {
                continue;
            }
            if self.active.is_empty() {
                return None;
            }
            self.service().await;
        }
    }

    fn tls_config(&mut self) -> Arc<rustls::ClientConfig> {
        self.tls
            .get_or_insert_with(|| {
                let roots =
                    rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Arc::new(
                    rustls::ClientConfig::builder()
                        .with_root_certificates(roots)
                        .with_no_client_auth(),
                )
            })
            .clone()
    }

    fn admit(&mut self) {
        while self.active.len() < self.config.concurrency {
            let Some(admission) = self.queue.pop_front() else {
                break;
            };
            let Admission { request, url, hops } = admission;
            let user_agent = self.config.user_agent.clone();
            let opened = Connection::open(request.clone(), &url, hops, &user_agent, || {
                self.tls_config()
            });
            match opened {
                Ok(connection) => {
                    tracing::debug!(request = %request.id, %url, hops, "admitted");
                    self.states.insert(request.id, RequestState::Streaming);
                    self.active.push_back(connection);
                    self.peak_active = self.peak_active.max(self.active.len());
                }
                Err(error) => self.fail(request, error),
            }
        }
    }

    /// Waits for one connection to become ready and advances it.
    async fn service(&mut self) {
        let timeout = self.config.poll_timeout;
        let woke = {
            let waits = self
                .active
                .iter_mut()
                .map(|connection| Box::pin(connection.wait()));
            tokio::time::timeout(timeout, select_all(waits))
                .await
                .map(|(wake, index, _)| (wake, index))
        };

        let Ok((wake, index)) = woke else {
            tracing::warn!(?timeout, active = self.active.len(), "no socket activity");
            for connection in std::mem::take(&mut self.active) {
                self.fail(connection.request, NetError::Timeout(timeout));
            }
            return;
        };
        let Some(mut connection) = self.active.remove(index) else {
            return;
        };

        let mut progress = Vec::new();
        if let Err(error) = connection.advance(wake, &mut progress) {
            self.flush_progress(&connection, progress);
            self.fail(connection.request, error);
            return;
        }
        if let Some(location) = progress.iter().find_map(|p| match p {
            Progress::Redirect(location) => Some(location.clone()),
            _ => None,
        }) {
            self.redirect(connection, &location);
            return;
        }
        let done = progress.iter().any(|p| matches!(p, Progress::Done));
        self.flush_progress(&connection, progress);
        if done {
            tracing::debug!(request = %connection.request.id, "finished");
            self.states
                .insert(connection.request.id, RequestState::Finished);
            self.events.push_back(Event::Finished {
                request: connection.request,
            });
        } else {
            // Serviced connections go to the back so a busy peer cannot
            // starve the rest.
            self.active.push_back(connection);
        }
    }

    fn flush_progress(&mut self, connection: &Connection, progress: Vec<Progress>) {
        for item in progress {
            let request = connection.request.clone();
            match item {
                Progress::Headers(head) => {
                    tracing::trace!(request = %request.id, status = head.status.code, "headers");
                    self.events.push_back(Event::Headers { request, head });
                }
                Progress::Body(data) => {
                    tracing::trace!(request = %request.id, len = data.len(), "body chunk");
                    self.events.push_back(Event::BodyChunk { request, data });
                }
                Progress::Redirect(_) | Progress::Done => {}
            }
        }
    }

    fn redirect(&mut self, connection: Connection, location: &str) {
        let hops = connection.hops + 1;
        if hops > self.config.max_redirects {
            let limit = self.config.max_redirects;
            self.fail(connection.request, NetError::TooManyRedirects { limit });
            return;
        }
        match connection.target.join(location) {
            Ok(url) => {
                tracing::debug!(request = %connection.request.id, %url, hops, "redirected");
                self.states
                    .insert(connection.request.id, RequestState::Enqueued);
                self.queue.push_front(Admission {
                    request: connection.request,
                    url,
                    hops,
                });
            }
            Err(error) => self.fail(connection.request, error),
        }
    }

    fn fail(&mut self, request: Request, error: NetError) {
        tracing::warn!(request = %request.id, url = %request.url, "request failed: {error}");
        self.states.insert(request.id, RequestState::Finished);
        self.events.push_back(Event::Failed { request, error });
    }
}
