//! Pending-call queue between the interpreter thread and the async host
//!
//! Script code runs on a blocking thread. Each recursive query it issues is
//! sent to the host as a [`PendingCall`] carrying a oneshot settle handle;
//! the calling script thread parks on the receiving half. [`service`] runs on
//! the async side for the duration of one `execute` and dispatches every call
//! to the real handlers, settling each handle exactly once.

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ParallelQueryHandler, RecursiveQueryHandler, SubQueryOutcome, SubQueryRequest};
use crate::rlm::RlmError;

pub(crate) const CANCELLED_MESSAGE: &str = "call cancelled: sandbox run aborted";

/// How long abandoned handler tasks get to return their partial outcome
/// before they are aborted
const CANCEL_GRACE: Duration = Duration::from_millis(500);

pub(crate) type Settle = oneshot::Sender<Result<CallReply, String>>;
type Settled = oneshot::Receiver<Result<CallReply, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Single,
    Parallel,
}

#[derive(Debug)]
pub(crate) enum CallRequest {
    Single(SubQueryRequest),
    Parallel(Vec<SubQueryRequest>),
}

impl CallRequest {
    fn kind(&self) -> CallKind {
        match self {
            Self::Single(_) => CallKind::Single,
            Self::Parallel(_) => CallKind::Parallel,
        }
    }
}

#[derive(Debug)]
pub(crate) enum CallReply {
    Single(String),
    Parallel(Vec<String>),
}

/// A recursive query issued by script code and not yet settled
pub(crate) struct PendingCall {
    pub id: u64,
    pub kind: CallKind,
    pub request: CallRequest,
    pub settle: Settle,
}

/// Script-side handle for issuing calls
#[derive(Clone)]
pub(crate) struct BridgeClient {
    tx: mpsc::UnboundedSender<PendingCall>,
    next_id: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl BridgeClient {
    pub fn new(tx: mpsc::UnboundedSender<PendingCall>) -> Self {
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn submit(&self, request: CallRequest) -> Result<Settled, String> {
        if self.is_cancelled() {
            return Err(CANCELLED_MESSAGE.to_string());
        }
        let (settle, settled) = oneshot::channel();
        let call = PendingCall {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind: request.kind(),
            request,
            settle,
        };
        self.tx
            .send(call)
            .map_err(|_| CANCELLED_MESSAGE.to_string())?;
        Ok(settled)
    }

    /// Issue a single query and park until it is settled
    pub fn query(&self, request: SubQueryRequest) -> Result<String, String> {
        let settled = self.submit(CallRequest::Single(request))?;
        single_reply(wait(settled))
    }

    /// Issue a single query without waiting for it
    pub fn query_async(&self, request: SubQueryRequest) -> QueryTicket {
        let state = match self.submit(CallRequest::Single(request)) {
            Ok(settled) => TicketState::Pending(settled),
            Err(e) => TicketState::Done(Err(e)),
        };
        QueryTicket {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Issue a batch and park until every item is answered
    pub fn query_batch(&self, requests: Vec<SubQueryRequest>) -> Result<Vec<String>, String> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let settled = self.submit(CallRequest::Parallel(requests))?;
        match wait(settled)? {
            CallReply::Parallel(answers) => Ok(answers),
            CallReply::Single(_) => Err("unexpected reply to batch query".to_string()),
        }
    }
}

fn wait(settled: Settled) -> Result<CallReply, String> {
    settled
        .blocking_recv()
        .map_err(|_| CANCELLED_MESSAGE.to_string())?
}

fn single_reply(reply: Result<CallReply, String>) -> Result<String, String> {
    match reply? {
        CallReply::Single(answer) => Ok(answer),
        CallReply::Parallel(_) => Err("unexpected reply to single query".to_string()),
    }
}

enum TicketState {
    Pending(Settled),
    Done(Result<String, String>),
}

/// Handle to a query started with `llm_query_async`
///
/// Waiting more than once returns the same result.
#[derive(Clone)]
pub struct QueryTicket {
    state: Arc<Mutex<TicketState>>,
}

impl QueryTicket {
    pub(crate) fn wait(&self) -> Result<String, String> {
        let mut state = self.state.lock();
        let current = std::mem::replace(
            &mut *state,
            TicketState::Done(Err(CANCELLED_MESSAGE.to_string())),
        );
        let result = match current {
            TicketState::Pending(settled) => single_reply(wait(settled)),
            TicketState::Done(result) => result,
        };
        *state = TicketState::Done(result.clone());
        result
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.state.lock(), TicketState::Done(_))
    }
}

/// Real handlers the bridge dispatches to
#[derive(Clone)]
pub(crate) struct Handlers {
    pub single: Arc<dyn RecursiveQueryHandler>,
    pub parallel: Option<Arc<dyn ParallelQueryHandler>>,
}

impl Handlers {
    async fn dispatch(
        &self,
        request: CallRequest,
        cancel: CancellationToken,
    ) -> (Result<CallReply, String>, Vec<SubQueryOutcome>) {
        match request {
            CallRequest::Single(request) => {
                let outcome = self.single.query(request, cancel).await;
                let reply = match &outcome.answer {
                    Ok(answer) => Ok(CallReply::Single(answer.clone())),
                    Err(e) => Err(e.to_string()),
                };
                (reply, vec![outcome])
            }
            CallRequest::Parallel(requests) => {
                let expected = requests.len();
                let outcomes = match &self.parallel {
                    Some(parallel) => parallel.query_all(requests, cancel).await,
                    None => {
                        join_all(
                            requests
                                .into_iter()
                                .map(|r| self.single.query(r, cancel.clone())),
                        )
                        .await
                    }
                };

                let mut answers: Vec<String> = outcomes
                    .iter()
                    .map(|o| match &o.answer {
                        Ok(answer) => answer.clone(),
                        Err(e) => format!("Error: {}", e),
                    })
                    .collect();
                answers.resize(expected, "Error: no answer returned".to_string());
                (Ok(CallReply::Parallel(answers)), outcomes)
            }
        }
    }
}

/// How servicing ended
pub(crate) enum ServiceEnd<T> {
    /// The interpreter returned (or panicked) before the deadline
    Finished(Result<T, JoinError>),
    /// The deadline passed; the interpreter may still be winding down
    TimedOut(JoinHandle<T>),
    /// The owner's cancellation token fired
    Cancelled(JoinHandle<T>),
}

pub(crate) struct Serviced<T> {
    pub end: ServiceEnd<T>,
    /// Outcomes of settled calls, in issue order
    pub sub_calls: Vec<SubQueryOutcome>,
}

/// Run the bridging loop until the interpreter finishes, the deadline passes
/// or `cancel` fires
///
/// Handler calls run as spawned tasks. On exit every call still outstanding
/// is settled with a cancellation error and the queue is closed, so nothing
/// keeps waiting on this loop once it returns. Handlers still running are
/// cancelled and awaited; their partial outcomes are kept, and tasks that
/// outlast the grace period are aborted and reported as cancelled. No
/// handler task outlives the call.
pub(crate) async fn service<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<PendingCall>,
    handlers: &Handlers,
    mut interpreter: JoinHandle<T>,
    deadline: Instant,
    cancelled: &AtomicBool,
    cancel: &CancellationToken,
) -> Serviced<T> {
    let calls_cancel = cancel.child_token();
    let mut settles: HashMap<u64, Settle> = HashMap::new();
    let mut aborts: HashMap<u64, AbortHandle> = HashMap::new();
    let mut finished: BTreeMap<u64, Vec<SubQueryOutcome>> = BTreeMap::new();
    let mut in_flight = FuturesUnordered::new();

    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let end = loop {
        // Queued calls are dispatched before a finished interpreter is noticed
        tokio::select! {
            biased;

            Some(call) = rx.recv() => {
                let PendingCall { id, kind, request, settle } = call;
                tracing::debug!(id, ?kind, "Dispatching sandbox sub-query");
                settles.insert(id, settle);
                let handlers = handlers.clone();
                let token = calls_cancel.clone();
                let task = tokio::spawn(async move { handlers.dispatch(request, token).await });
                aborts.insert(id, task.abort_handle());
                in_flight.push(async move { (id, task.await) });
            }
            Some((id, joined)) = in_flight.next() => {
                aborts.remove(&id);
                let reply = collect(&mut finished, id, joined);
                if let Some(settle) = settles.remove(&id) {
                    let _ = settle.send(reply);
                }
            }
            joined = &mut interpreter => break ServiceEnd::Finished(joined),
            _ = &mut timeout => {
                tracing::warn!(outstanding = settles.len(), "Sandbox deadline reached, cancelling pending calls");
                break ServiceEnd::TimedOut(interpreter);
            }
            _ = cancel.cancelled() => {
                tracing::debug!(outstanding = settles.len(), "Sandbox run cancelled by its owner");
                break ServiceEnd::Cancelled(interpreter);
            }
        }
    };

    cancelled.store(true, Ordering::SeqCst);
    rx.close();
    let mut dropped = settles.len();
    for (_, settle) in settles.drain() {
        let _ = settle.send(Err(CANCELLED_MESSAGE.to_string()));
    }
    while let Ok(call) = rx.try_recv() {
        dropped += 1;
        let _ = call.settle.send(Err(CANCELLED_MESSAGE.to_string()));
    }
    if dropped > 0 {
        tracing::debug!(dropped, "Settled outstanding sandbox calls as cancelled");
    }

    if !in_flight.is_empty() {
        calls_cancel.cancel();
        let drained = tokio::time::timeout(CANCEL_GRACE, async {
            while let Some((id, joined)) = in_flight.next().await {
                aborts.remove(&id);
                let _ = collect(&mut finished, id, joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = aborts.len(),
                "Sub-query tasks ignored cancellation, aborting"
            );
            for (_, handle) in aborts.drain() {
                handle.abort();
            }
            while let Some((id, joined)) = in_flight.next().await {
                let _ = collect(&mut finished, id, joined);
            }
        }
    }

    Serviced {
        end,
        sub_calls: finished.into_values().flatten().collect(),
    }
}

/// Record a joined handler task and build the reply for its caller
fn collect(
    finished: &mut BTreeMap<u64, Vec<SubQueryOutcome>>,
    id: u64,
    joined: Result<(Result<CallReply, String>, Vec<SubQueryOutcome>), JoinError>,
) -> Result<CallReply, String> {
    match joined {
        Ok((reply, outcomes)) => {
            finished.insert(id, outcomes);
            reply
        }
        Err(e) if e.is_cancelled() => {
            finished.insert(id, vec![SubQueryOutcome::failed(RlmError::Cancelled)]);
            Err(CANCELLED_MESSAGE.to_string())
        }
        Err(e) => Err(format!("sub-query task failed: {}", e)),
    }
}
