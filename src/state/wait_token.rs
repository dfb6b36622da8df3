// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Single-shot rendezvous between the thread that sent a request and the
//! protocol task that receives its terminal response.

use crate::errors::{Error, Result};
use crate::messaging::Message;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
enum TokenState {
    Pending,
    Complete(Message),
    Failed(String),
}

#[derive(Debug)]
struct TokenInner {
    message: Message,
    min_wait: Duration,
    state: Mutex<TokenState>,
    notify: Notify,
}

/// A one-shot confirmation cell: `PENDING -> {COMPLETE, FAILED}`.
///
/// The first `complete` or `fail` wins and wakes every waiter; later calls are
/// no-ops. Waiting tolerates spurious wakes via a deadline loop, and the
/// effective wait is floored by the error-retry window so retry pathways can
/// finish even under aggressive caller deadlines.
#[derive(Clone, Debug)]
pub struct WaitToken {
    inner: Arc<TokenInner>,
}

impl WaitToken {
    /// New pending token carrying the originating message.
    pub(crate) fn new(message: Message, min_wait: Duration) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                message,
                min_wait,
                state: Mutex::new(TokenState::Pending),
                notify: Notify::new(),
            }),
        }
    }

    /// The message this token confirms.
    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the terminal response and wake all waiters. No-op once settled.
    pub fn complete(&self, response: Message) {
        {
            let mut state = self.state();
            if !matches!(*state, TokenState::Pending) {
                return;
            }
            *state = TokenState::Complete(response);
        }
        self.inner.notify.notify_waiters();
    }

    /// Record a failure reason and wake all waiters. No-op once settled.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut state = self.state();
            if !matches!(*state, TokenState::Pending) {
                return;
            }
            *state = TokenState::Failed(reason.into());
        }
        self.inner.notify.notify_waiters();
    }

    /// True once a terminal response has been recorded.
    pub fn is_complete(&self) -> bool {
        matches!(*self.state(), TokenState::Complete(_))
    }

    /// True once a failure has been recorded.
    pub fn is_error(&self) -> bool {
        matches!(*self.state(), TokenState::Failed(_))
    }

    fn outcome(&self) -> Option<Result<Message>> {
        match &*self.state() {
            TokenState::Pending => None,
            TokenState::Complete(response) => Some(Ok(response.clone())),
            TokenState::Failed(reason) => Some(Err(Error::FailedConfirmation(reason.clone()))),
        }
    }

    /// Block until the token settles or the deadline passes.
    ///
    /// The effective wait is `max(timeout, min_wait)`. Settled tokens return
    /// immediately, on every call.
    pub async fn wait(&self, timeout: Duration) -> Result<Message> {
        let effective = timeout.max(self.inner.min_wait);
        let deadline = Instant::now() + effective;
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before the state check so a wake between check and
            // await is not lost
            let _ready = notified.as_mut().enable();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(effective));
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}
