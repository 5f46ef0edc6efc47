use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, StageState};
use crate::error::{CheckpointError, NetError};
use crate::net::{ClientConfig, Event, Request, RequestId, RequestMultiplexer};
use crate::stream::{ByteStream, PipelineContext, StreamState};

struct Tracked {
    request: Request,
    delivered: u64,
    /// Absolute end of the body, once a response announced its length.
    total: Option<u64>,
}

impl Tracked {
    fn new(request: Request, delivered: u64, total: Option<u64>) -> Self {
        Self {
            request,
            delivered,
            total,
        }
    }

    /// Every body byte was delivered; only the closing event is missing.
    fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| self.request.offset + self.delivered >= total)
    }
}

/// Source stage streaming the bodies of many HTTP requests.
///
/// Each body chunk is tagged with its request id as file id, so a
/// [`Demultiplexer`](crate::Demultiplexer) downstream can keep a separate
/// decoder per response. A failed request becomes an error chunk naming its
/// URL; the other requests carry on.
pub struct HttpSource {
    state: StreamState,
    client: RequestMultiplexer,
    requests: BTreeMap<RequestId, Tracked>,
    enqueued: bool,
}

#[derive(Serialize, Deserialize)]
struct PendingRequest {
    request: Request,
    delivered: u64,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct HttpSourceCheckpoint {
    stream: StreamState,
    pending: Vec<PendingRequest>,
}

impl HttpSource {
    pub fn new(config: ClientConfig, requests: Vec<Request>) -> Result<Self, NetError> {
        let requests = requests
            .into_iter()
            .map(|request| (request.id, Tracked::new(request, 0, None)))
            .collect();
        Ok(Self {
            state: StreamState::new(),
            client: RequestMultiplexer::new(config)?,
            requests,
            enqueued: false,
        })
    }

    /// One request per URL, numbered from 1 in the given order.
    pub fn from_urls<I, U>(config: ClientConfig, urls: I) -> Result<Self, NetError>
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        let requests = urls
            .into_iter()
            .zip(1..)
            .map(|(url, id)| Request::new(id, url))
            .collect();
        Self::new(config, requests)
    }

    /// Looks up the request behind a file id produced by this stage.
    pub fn request(&self, file_id: &str) -> Option<&Request> {
        let id = RequestId(file_id.parse().ok()?);
        self.requests.get(&id).map(|tracked| &tracked.request)
    }

    fn start(&mut self) {
        let requests: Vec<Request> = self
            .requests
            .values()
            .map(|tracked| {
                let offset = tracked.request.offset + tracked.delivered;
                tracked.request.clone().with_offset(offset)
            })
            .collect();
        self.client.enqueue(requests);
        self.enqueued = true;
    }
}

impl ByteStream for HttpSource {
    fn state(&self) -> &StreamState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut StreamState {
        &mut self.state
    }

    fn produce_next(&mut self, _ctx: &mut PipelineContext<'_>) -> bool {
        if !self.state.begin_tick() {
            return false;
        }
        if !self.enqueued {
            self.start();
        }
        loop {
            let Some(event) = self.client.poll_next_event() else {
                tracing::debug!("all requests done");
                self.state.finish();
                return false;
            };
            match event {
                Event::Headers { request, head } => {
                    tracing::debug!(
                        request = %request.id,
                        status = head.status.code,
                        length = ?head.content_length(),
                        encoding = head.content_encoding().unwrap_or("identity"),
                        chunked = head.is_chunked(),
                        "response"
                    );
                    // A 206 body starts at the offset we asked for; anything
                    // else is the whole resource.
                    let total = head.content_length().map(|len| match head.status.code {
                        206 => request.offset + len,
                        _ => len,
                    });
                    if let Some(tracked) = self.requests.get_mut(&request.id) {
                        tracked.total = total;
                    }
                }
                Event::BodyChunk { request, data } => {
                    if let Some(tracked) = self.requests.get_mut(&request.id) {
                        tracked.delivered += data.len() as u64;
                    }
                    self.state.emit(data, &request.id.to_string());
                    return true;
                }
                Event::Failed { request, error } => {
                    self.requests.remove(&request.id);
                    self.state.file_id = request.id.to_string();
                    self.state.emit_error(format!("{}: {error}", request.url));
                    return true;
                }
                Event::Finished { request } => {
                    self.requests.remove(&request.id);
                }
            }
        }
    }

    fn kill(&mut self, code: i32) {
        self.requests.clear();
        if let Ok(fresh) = RequestMultiplexer::new(self.client.config().clone()) {
            // Dropping the old client closes its sockets.
            self.client = fresh;
        }
        self.state.kill(code);
    }

    fn pause(&self) -> Result<StageState, CheckpointError> {
        checkpoint::save(&HttpSourceCheckpoint {
            stream: self.state.clone(),
            pending: self
                .requests
                .values()
                .filter(|tracked| !tracked.is_complete())
                .map(|tracked| PendingRequest {
                    request: tracked.request.clone(),
                    delivered: tracked.delivered,
                    total: tracked.total,
                })
                .collect(),
        })
    }

    fn resume(&mut self, state: StageState) -> Result<(), CheckpointError> {
        let saved: HttpSourceCheckpoint = checkpoint::load(state)?;
        self.client = RequestMultiplexer::new(self.client.config().clone())
            .map_err(|e| CheckpointError::Invalid(e.to_string()))?;
        self.requests = saved
            .pending
            .into_iter()
            .map(|pending| {
                let id = pending.request.id;
                (id, Tracked::new(pending.request, pending.delivered, pending.total))
            })
            .collect();
        self.state = saved.stream;
        self.enqueued = false;
        Ok(())
    }
}
